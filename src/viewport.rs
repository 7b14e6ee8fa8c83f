use crate::enums::{Colormap, ViewType};
use crate::render::{DisplaySettings, WindowLevel};
use crate::signal::Signal;
use crate::volume::Volume;

#[derive(Debug, Clone, PartialEq)]
pub enum ViewportEvent {
    SliceChanged(usize),
    WindowLevelChanged(WindowLevel),
    ZoomChanged(f64),
    ViewTypeChanged(ViewType),
}

/// Navigation state of one view onto a volume.
#[derive(Debug)]
pub struct Viewport {
    view_type: ViewType,
    dims: (usize, usize, usize),
    slice_count: usize,
    current_slice: usize,
    zoom: f64,
    display: DisplaySettings,
    pub show_axes: bool,
    pub show_scale: bool,
    pub events: Signal<ViewportEvent>,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            view_type: ViewType::Axial,
            dims: (0, 0, 0),
            slice_count: 0,
            current_slice: 0,
            zoom: 1.0,
            display: DisplaySettings::default(),
            show_axes: true,
            show_scale: false,
            events: Signal::new(),
        }
    }
}

impl Viewport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Axial viewport on the middle slice with the volume's full-range window.
    pub fn for_volume(volume: &Volume) -> Self {
        let mut viewport = Self::new();
        viewport.set_volume(volume);
        viewport.display.window_level = volume.optimal_window_level();
        viewport
    }

    /// Adopts the volume's extent and moves to the middle slice.
    pub fn set_volume(&mut self, volume: &Volume) {
        self.dims = volume.dim();
        self.refresh_slice_count();
    }

    pub fn clear_volume(&mut self) {
        self.dims = (0, 0, 0);
        self.slice_count = 0;
        self.current_slice = 0;
    }

    fn refresh_slice_count(&mut self) {
        let (depth, height, width) = self.dims;
        self.slice_count = match self.view_type {
            ViewType::Axial | ViewType::Volume3D => depth,
            ViewType::Coronal => height,
            ViewType::Sagittal => width,
        };
        self.current_slice = 0;
        if self.slice_count > 0 {
            self.set_slice_position(self.slice_count / 2);
        }
    }

    pub fn view_type(&self) -> ViewType {
        self.view_type
    }

    pub fn set_view_type(&mut self, view_type: ViewType) {
        if self.view_type == view_type {
            return;
        }
        self.view_type = view_type;
        self.events.emit(&ViewportEvent::ViewTypeChanged(view_type));
        self.refresh_slice_count();
    }

    pub fn slice_count(&self) -> usize {
        self.slice_count
    }

    pub fn current_slice(&self) -> usize {
        self.current_slice
    }

    /// Moves to `slice`. Out-of-range requests are ignored and return false.
    pub fn set_slice_position(&mut self, slice: usize) -> bool {
        if slice >= self.slice_count {
            return false;
        }
        self.current_slice = slice;
        self.events.emit(&ViewportEvent::SliceChanged(slice));
        true
    }

    /// One-based "current/total" label.
    pub fn slice_label(&self) -> String {
        if self.slice_count == 0 {
            return "0/0".to_string();
        }
        format!("{}/{}", self.current_slice + 1, self.slice_count)
    }

    pub fn window_level(&self) -> WindowLevel {
        self.display.window_level
    }

    pub fn set_window_level(&mut self, window: f64, level: f64) {
        let window_level = WindowLevel::new(window, level);
        self.display.window_level = window_level;
        self.events.emit(&ViewportEvent::WindowLevelChanged(window_level));
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    /// Non-positive or non-finite factors are ignored.
    pub fn set_zoom(&mut self, zoom: f64) -> bool {
        if !(zoom.is_finite() && zoom > 0.0) {
            return false;
        }
        self.zoom = zoom;
        self.events.emit(&ViewportEvent::ZoomChanged(zoom));
        true
    }

    pub fn reset_zoom(&mut self) {
        self.set_zoom(1.0);
    }

    pub fn reset_view(&mut self) {
        if self.slice_count > 0 {
            self.set_slice_position(self.slice_count / 2);
        }
        self.reset_zoom();
    }

    pub fn display(&self) -> &DisplaySettings {
        &self.display
    }

    pub fn set_colormap(&mut self, colormap: Colormap) {
        self.display.colormap = colormap;
    }

    pub fn set_inverted(&mut self, invert: bool) {
        self.display.invert = invert;
    }

    pub fn set_brightness(&mut self, brightness: i32) {
        self.display.brightness = brightness.clamp(-100, 100);
    }

    pub fn set_contrast(&mut self, contrast: i32) {
        self.display.contrast = contrast.clamp(-100, 100);
    }

    pub fn window_level_label(&self) -> String {
        let wl = self.display.window_level;
        format!("W/L: {}/{}", wl.window as i64, wl.level as i64)
    }

    pub fn zoom_label(&self) -> String {
        format!("zoom: {}%", (self.zoom * 100.0) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::EventLog;
    use ndarray::Array3;

    fn volume() -> Volume {
        Volume::new(Array3::zeros((10, 20, 30)), (1.0, 1.0, 1.0))
    }

    #[test]
    fn set_volume_starts_in_the_middle() {
        let viewport = Viewport::for_volume(&volume());
        assert_eq!(viewport.slice_count(), 10);
        assert_eq!(viewport.current_slice(), 5);
        assert_eq!(viewport.slice_label(), "6/10");
    }

    #[test]
    fn out_of_range_slice_is_ignored() {
        let mut viewport = Viewport::for_volume(&volume());
        let log = EventLog::new();
        log.attach(&mut viewport.events);

        assert!(!viewport.set_slice_position(10));
        assert_eq!(viewport.current_slice(), 5);
        assert!(log.drain().is_empty());

        assert!(viewport.set_slice_position(9));
        assert_eq!(log.drain(), vec![ViewportEvent::SliceChanged(9)]);
    }

    #[test]
    fn view_type_changes_slice_count() {
        let mut viewport = Viewport::for_volume(&volume());
        viewport.set_view_type(ViewType::Sagittal);
        assert_eq!(viewport.slice_count(), 30);
        assert_eq!(viewport.current_slice(), 15);
        viewport.set_view_type(ViewType::Volume3D);
        assert_eq!(viewport.slice_count(), 10);
    }

    #[test]
    fn reset_view_restores_middle_and_unit_zoom() {
        let mut viewport = Viewport::for_volume(&volume());
        viewport.set_slice_position(1);
        viewport.set_zoom(3.0);
        viewport.reset_view();
        assert_eq!(viewport.current_slice(), 5);
        assert_eq!(viewport.zoom(), 1.0);
    }

    #[test]
    fn invalid_zoom_is_rejected() {
        let mut viewport = Viewport::new();
        assert!(!viewport.set_zoom(0.0));
        assert!(!viewport.set_zoom(f64::NAN));
        assert_eq!(viewport.zoom(), 1.0);
        assert_eq!(viewport.zoom_label(), "zoom: 100%");
    }
}
