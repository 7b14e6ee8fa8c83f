//! Turning a volume plus view state into pixels.

use crate::enums::{Colormap, Interpolation, Orientation, ViewType};
use crate::signal::Signal;
use crate::viewport::Viewport;
use crate::volume::Volume;

use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use log::debug;
use ndarray::ArrayView2;
use thiserror::Error;
use web_time::Instant;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer has not been initialized")]
    NotInitialized,

    #[error("slice {index} is outside 0..{count}")]
    SliceOutOfRange { index: usize, count: usize },

    #[error("nothing to render: the volume is empty")]
    EmptyImage,
}

/// Linear display mapping. Values at `level - window / 2` map to black,
/// values at `level + window / 2` to white.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLevel {
    pub window: f64,
    pub level: f64,
}

impl Default for WindowLevel {
    fn default() -> Self {
        Self::new(400.0, 40.0)
    }
}

impl WindowLevel {
    pub const MIN_WINDOW: f64 = 1.0;

    pub fn new(window: f64, level: f64) -> Self {
        Self {
            window: window.max(Self::MIN_WINDOW),
            level,
        }
    }

    pub fn from_range(min: f64, max: f64) -> Self {
        Self::new(max - min, (max + min) / 2.0)
    }

    pub fn lower(&self) -> f64 {
        self.level - self.window / 2.0
    }

    pub fn upper(&self) -> f64 {
        self.level + self.window / 2.0
    }

    #[inline]
    pub fn map(&self, value: f32) -> u8 {
        if value.is_nan() {
            return 0;
        }
        let t = (value as f64 - self.lower()) / self.window;
        (t * 255.0).round().clamp(0.0, 255.0) as u8
    }
}

/// Everything besides geometry that affects how a slice looks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplaySettings {
    pub window_level: WindowLevel,
    pub colormap: Colormap,
    pub invert: bool,
    /// -100..=100, shifts the output by up to half the display range
    pub brightness: i32,
    /// -100..=100, scales around mid grey; -100 flattens to grey
    pub contrast: i32,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            window_level: WindowLevel::default(),
            colormap: Colormap::Gray,
            invert: false,
            brightness: 0,
            contrast: 0,
        }
    }
}

impl DisplaySettings {
    /// 256-entry table from windowed grey to final colour.
    pub fn lookup_table(&self) -> [Rgb<u8>; 256] {
        let gain = (100 + self.contrast.clamp(-100, 100)) as f64 / 100.0;
        let offset = self.brightness.clamp(-100, 100) as f64 * 1.275;
        let mut table = [Rgb([0, 0, 0]); 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut v = ((i as f64 - 127.5) * gain + 127.5 + offset).clamp(0.0, 255.0);
            if self.invert {
                v = 255.0 - v;
            }
            *entry = colormap_rgb(self.colormap, v / 255.0);
        }
        table
    }

    pub fn colorize(&self, gray: &GrayImage) -> RgbImage {
        let table = self.lookup_table();
        let (width, height) = gray.dimensions();
        RgbImage::from_fn(width, height, |x, y| table[gray.get_pixel(x, y).0[0] as usize])
    }
}

type ColorStop = (f64, [f64; 3]);

const RAINBOW_STOPS: [ColorStop; 5] = [
    (0.0, [0.0, 0.0, 0.5]),
    (0.25, [0.0, 0.0, 1.0]),
    (0.5, [0.0, 1.0, 1.0]),
    (0.75, [1.0, 1.0, 0.0]),
    (1.0, [1.0, 0.0, 0.0]),
];

const COOL_WARM_STOPS: [ColorStop; 3] = [
    (0.0, [0.230, 0.299, 0.754]),
    (0.5, [0.865, 0.865, 0.865]),
    (1.0, [0.706, 0.016, 0.150]),
];

/// Colour of `colormap` at `t` in `[0, 1]`.
pub fn colormap_rgb(colormap: Colormap, t: f64) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0);
    let rgb = match colormap {
        Colormap::Gray => [t, t, t],
        Colormap::Rainbow => interpolate_stops(&RAINBOW_STOPS, t),
        Colormap::Hot => [
            (3.0 * t).clamp(0.0, 1.0),
            (3.0 * t - 1.0).clamp(0.0, 1.0),
            (3.0 * t - 2.0).clamp(0.0, 1.0),
        ],
        Colormap::CoolWarm => interpolate_stops(&COOL_WARM_STOPS, t),
    };
    Rgb(rgb.map(|c| (c * 255.0).round() as u8))
}

fn interpolate_stops(stops: &[ColorStop], t: f64) -> [f64; 3] {
    for pair in stops.windows(2) {
        let (t0, c0) = pair[0];
        let (t1, c1) = pair[1];
        if t <= t1 {
            let f = if t1 > t0 { (t - t0) / (t1 - t0) } else { 0.0 };
            return [
                c0[0] + (c1[0] - c0[0]) * f,
                c0[1] + (c1[1] - c0[1]) * f,
                c0[2] + (c1[2] - c0[2]) * f,
            ];
        }
    }
    stops.last().map(|s| s.1).unwrap_or([0.0; 3])
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    Started,
    Finished,
    Failed(String),
    CameraReset,
}

/// Produces RGB frames of a [`Viewport`] onto a volume.
#[derive(Debug)]
pub struct Renderer {
    background: Rgb<u8>,
    canvas: Option<(u32, u32)>,
    max_texture_size: u32,
    interpolation: Interpolation,
    initialized: bool,
    pub events: Signal<RenderEvent>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self {
            background: Rgb([0, 0, 0]),
            canvas: None,
            max_texture_size: 2048,
            interpolation: Interpolation::Bilinear,
            initialized: false,
            events: Signal::new(),
        }
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        debug!("renderer initialized");
    }

    pub fn cleanup(&mut self) {
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Components in `[0, 1]`.
    pub fn set_background_color(&mut self, r: f64, g: f64, b: f64) {
        let to_u8 = |c: f64| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        self.background = Rgb([to_u8(r), to_u8(g), to_u8(b)]);
    }

    pub fn background_color(&self) -> Rgb<u8> {
        self.background
    }

    /// Fixed output size; `None` renders at the zoomed image size.
    pub fn set_canvas_size(&mut self, canvas: Option<(u32, u32)>) {
        self.canvas = canvas;
    }

    pub fn set_max_texture_size(&mut self, size: u32) {
        self.max_texture_size = size.max(1);
    }

    pub fn set_interpolation(&mut self, interpolation: Interpolation) {
        self.interpolation = interpolation;
    }

    pub fn reset_camera(&self) {
        self.events.emit(&RenderEvent::CameraReset);
    }

    pub fn render(&self, volume: &Volume, viewport: &Viewport) -> Result<RgbImage, RenderError> {
        if !self.initialized {
            return Err(RenderError::NotInitialized);
        }
        if volume.is_empty() {
            return Err(RenderError::EmptyImage);
        }
        let start = Instant::now();
        self.events.emit(&RenderEvent::Started);

        let display = viewport.display();
        let gray = self.grayscale(volume, viewport.view_type(), viewport.current_slice(), display);
        let gray = match gray {
            Ok(gray) => gray,
            Err(err) => {
                self.events.emit(&RenderEvent::Failed(err.to_string()));
                return Err(err);
            }
        };
        let frame = display.colorize(&gray);
        let frame = self.apply_zoom(frame, viewport.zoom());
        let frame = self.compose(frame);

        self.events.emit(&RenderEvent::Finished);
        debug!(
            "rendered {:?} slice {} at {}x{} in {:?}",
            viewport.view_type(),
            viewport.current_slice(),
            frame.width(),
            frame.height(),
            start.elapsed()
        );
        Ok(frame)
    }

    fn grayscale(
        &self,
        volume: &Volume,
        view_type: ViewType,
        slice: usize,
        display: &DisplaySettings,
    ) -> Result<GrayImage, RenderError> {
        let orientation = view_type.orientation();
        let image = if view_type == ViewType::Volume3D {
            let projection = volume
                .maximum_intensity_projection(Orientation::Axial)
                .ok_or(RenderError::EmptyImage)?;
            self.plane(volume, &projection.view(), orientation, display)
        } else {
            let plane = volume.get_slice_from_axis(slice, &orientation).ok_or(
                RenderError::SliceOutOfRange {
                    index: slice,
                    count: volume.slice_count(orientation),
                },
            )?;
            self.plane(volume, &plane, orientation, display)
        };
        image.ok_or(RenderError::EmptyImage)
    }

    fn plane(
        &self,
        volume: &Volume,
        plane: &ArrayView2<'_, f32>,
        orientation: Orientation,
        display: &DisplaySettings,
    ) -> Option<GrayImage> {
        volume.plane_to_image(plane, orientation, self.interpolation, display.window_level)
    }

    fn apply_zoom(&self, frame: RgbImage, zoom: f64) -> RgbImage {
        if (zoom - 1.0).abs() < 1e-6 {
            return frame;
        }
        let limit = self.max_texture_size as f64;
        let width = (frame.width() as f64 * zoom).round().clamp(1.0, limit) as u32;
        let height = (frame.height() as f64 * zoom).round().clamp(1.0, limit) as u32;
        let filter = match self.interpolation {
            Interpolation::Bilinear => FilterType::Triangle,
            Interpolation::None => FilterType::Nearest,
        };
        imageops::resize(&frame, width, height, filter)
    }

    fn compose(&self, frame: RgbImage) -> RgbImage {
        let Some((width, height)) = self.canvas else {
            return frame;
        };
        let width = width.clamp(1, self.max_texture_size);
        let height = height.clamp(1, self.max_texture_size);
        let mut canvas = RgbImage::from_pixel(width, height, self.background);
        let x = (width as i64 - frame.width() as i64) / 2;
        let y = (height as i64 - frame.height() as i64) / 2;
        imageops::overlay(&mut canvas, &frame, x, y);
        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::EventLog;
    use ndarray::Array3;

    fn gradient_volume() -> Volume {
        let data = Array3::from_shape_fn((4, 8, 8), |(_, _, x)| x as f32 * 10.0);
        Volume::new(data, (1.0, 1.0, 1.0))
    }

    #[test]
    fn window_level_maps_bounds_to_black_and_white() {
        let wl = WindowLevel::new(100.0, 50.0);
        assert_eq!(wl.map(0.0), 0);
        assert_eq!(wl.map(-20.0), 0);
        assert_eq!(wl.map(100.0), 255);
        assert_eq!(wl.map(50.0), 128);
        assert_eq!(wl.map(f32::NAN), 0);
    }

    #[test]
    fn window_never_collapses_below_one() {
        let wl = WindowLevel::new(0.0, 10.0);
        assert_eq!(wl.window, WindowLevel::MIN_WINDOW);
    }

    #[test]
    fn colormap_endpoints() {
        assert_eq!(colormap_rgb(Colormap::Gray, 1.0), Rgb([255, 255, 255]));
        assert_eq!(colormap_rgb(Colormap::Rainbow, 0.0), Rgb([0, 0, 128]));
        assert_eq!(colormap_rgb(Colormap::Rainbow, 1.0), Rgb([255, 0, 0]));
        assert_eq!(colormap_rgb(Colormap::Hot, 0.0), Rgb([0, 0, 0]));
        assert_eq!(colormap_rgb(Colormap::Hot, 1.0), Rgb([255, 255, 255]));
    }

    #[test]
    fn invert_and_contrast_shape_lookup_table() {
        let inverted = DisplaySettings {
            invert: true,
            ..DisplaySettings::default()
        };
        assert_eq!(inverted.lookup_table()[0], Rgb([255, 255, 255]));

        let flat = DisplaySettings {
            contrast: -100,
            ..DisplaySettings::default()
        };
        let table = flat.lookup_table();
        assert_eq!(table[0], table[255]);
    }

    #[test]
    fn render_requires_initialization() {
        let renderer = Renderer::new();
        let volume = gradient_volume();
        let viewport = Viewport::for_volume(&volume);
        assert!(matches!(
            renderer.render(&volume, &viewport),
            Err(RenderError::NotInitialized)
        ));
    }

    #[test]
    fn failed_render_reports_a_terminal_event() {
        let mut renderer = Renderer::new();
        renderer.initialize();
        let log = EventLog::new();
        log.attach(&mut renderer.events);

        let tall = Volume::new(Array3::zeros((6, 8, 8)), (1.0, 1.0, 1.0));
        let mut viewport = Viewport::for_volume(&tall);
        assert!(viewport.set_slice_position(5));

        let result = renderer.render(&gradient_volume(), &viewport);
        assert!(matches!(
            result,
            Err(RenderError::SliceOutOfRange { index: 5, count: 4 })
        ));
        let events = log.drain();
        assert_eq!(events.first(), Some(&RenderEvent::Started));
        assert!(matches!(events.last(), Some(RenderEvent::Failed(_))));
        assert!(!events.contains(&RenderEvent::Finished));
    }

    #[test]
    fn zoom_scales_output() {
        let mut renderer = Renderer::new();
        renderer.initialize();
        let volume = gradient_volume();
        let mut viewport = Viewport::for_volume(&volume);
        viewport.set_zoom(2.0);
        let frame = renderer.render(&volume, &viewport).unwrap();
        assert_eq!(frame.dimensions(), (16, 16));
    }

    #[test]
    fn canvas_centres_frame_on_background() {
        let mut renderer = Renderer::new();
        renderer.initialize();
        renderer.set_background_color(0.0, 0.0, 1.0);
        renderer.set_canvas_size(Some((20, 20)));
        let volume = gradient_volume();
        let viewport = Viewport::for_volume(&volume);
        let frame = renderer.render(&volume, &viewport).unwrap();
        assert_eq!(frame.dimensions(), (20, 20));
        assert_eq!(*frame.get_pixel(0, 0), Rgb([0, 0, 255]));
        assert_ne!(*frame.get_pixel(13, 10), Rgb([0, 0, 255]));
    }

    #[test]
    fn volume_view_renders_projection() {
        let mut renderer = Renderer::new();
        renderer.initialize();
        let volume = gradient_volume();
        let mut viewport = Viewport::for_volume(&volume);
        viewport.set_view_type(ViewType::Volume3D);
        let frame = renderer.render(&volume, &viewport).unwrap();
        assert_eq!(frame.dimensions(), (8, 8));
    }
}
