//! Parameter panel state.
//!
//! Every numeric control exists twice in the panel: an integer slider and a
//! floating-point spin box. [`RangedValue`] keeps the two in step, so writing
//! through either side updates the shared value and clamps it to the range.

use std::path::PathBuf;

use crate::enums::{Colormap, MeasurementTool, RegistrationKind, ViewType};
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangedValue {
    value: f64,
    min: f64,
    max: f64,
    /// slider position = value * slider_scale
    slider_scale: f64,
}

impl RangedValue {
    pub fn new(value: f64, min: f64, max: f64, slider_scale: f64) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            value: value.clamp(min, max),
            min,
            max,
            slider_scale,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Returns true when the stored value changed.
    pub fn set(&mut self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let value = value.clamp(self.min, self.max);
        if value == self.value {
            return false;
        }
        self.value = value;
        true
    }

    pub fn set_from_slider(&mut self, position: i32) -> bool {
        self.set(position as f64 / self.slider_scale)
    }

    pub fn slider_position(&self) -> i32 {
        (self.value * self.slider_scale).round() as i32
    }

    pub fn slider_range(&self) -> (i32, i32) {
        (
            (self.min * self.slider_scale).round() as i32,
            (self.max * self.slider_scale).round() as i32,
        )
    }

    /// Narrows or widens the range; the value is pulled inside.
    pub fn set_range(&mut self, min: f64, max: f64) -> bool {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        self.min = min;
        self.max = max;
        let clamped = self.value.clamp(min, max);
        let changed = clamped != self.value;
        self.value = clamped;
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterId {
    Window,
    Level,
    Slice,
    Zoom,
    ThresholdLower,
    ThresholdUpper,
    Opacity,
    Brightness,
    Contrast,
    Sigma,
    KernelSize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterKind {
    #[default]
    Gaussian,
    Median,
    Sharpen,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterEvent {
    WindowLevelChanged { window: f64, level: f64 },
    SliceChanged(usize),
    ZoomChanged(f64),
    ThresholdChanged { lower: f64, upper: f64 },
    OpacityChanged(f64),
    BrightnessChanged(i32),
    ContrastChanged(i32),
    SigmaChanged(f64),
    KernelSizeChanged(usize),
    ColormapChanged(Colormap),
    InvertColorsChanged(bool),
    ViewTypeChanged(ViewType),
    FilterTypeChanged(FilterKind),
    FixedImageChanged(PathBuf),
    MovingImageChanged(PathBuf),
    RegistrationAlgorithmChanged(RegistrationKind),
    GaussianFilterRequested { sigma: f64, kernel_size: usize },
    MedianFilterRequested { kernel_size: usize },
    SharpenFilterRequested,
    StartRegistrationRequested,
    ResetRegistrationRequested,
    MeasurementToolSelected(MeasurementTool),
    ClearMeasurementsRequested,
    ResetZoomRequested,
    Reset,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationParameters {
    pub fixed_image: Option<PathBuf>,
    pub moving_image: Option<PathBuf>,
    pub algorithm: Option<RegistrationKind>,
}

#[derive(Debug)]
pub struct ParameterState {
    window: RangedValue,
    level: RangedValue,
    slice: RangedValue,
    zoom: RangedValue,
    threshold_lower: RangedValue,
    threshold_upper: RangedValue,
    opacity: RangedValue,
    brightness: RangedValue,
    contrast: RangedValue,
    sigma: RangedValue,
    kernel_size: RangedValue,
    colormap: Colormap,
    invert_colors: bool,
    view_type: ViewType,
    filter_type: FilterKind,
    registration: RegistrationParameters,
    pub events: Signal<ParameterEvent>,
}

impl Default for ParameterState {
    fn default() -> Self {
        Self {
            window: RangedValue::new(Self::DEFAULT_WINDOW, 1.0, 2000.0, 1.0),
            level: RangedValue::new(Self::DEFAULT_LEVEL, -1000.0, 1000.0, 1.0),
            slice: RangedValue::new(0.0, 0.0, 100.0, 1.0),
            zoom: RangedValue::new(1.0, 0.1, 5.0, 100.0),
            threshold_lower: RangedValue::new(0.0, 0.0, 255.0, 1.0),
            threshold_upper: RangedValue::new(255.0, 0.0, 255.0, 1.0),
            opacity: RangedValue::new(1.0, 0.0, 1.0, 100.0),
            brightness: RangedValue::new(0.0, -100.0, 100.0, 1.0),
            contrast: RangedValue::new(0.0, -100.0, 100.0, 1.0),
            sigma: RangedValue::new(1.0, 0.1, 10.0, 10.0),
            kernel_size: RangedValue::new(3.0, 3.0, 15.0, 1.0),
            colormap: Colormap::Gray,
            invert_colors: false,
            view_type: ViewType::Axial,
            filter_type: FilterKind::Gaussian,
            registration: RegistrationParameters::default(),
            events: Signal::new(),
        }
    }
}

impl ParameterState {
    pub const DEFAULT_WINDOW: f64 = 400.0;
    pub const DEFAULT_LEVEL: f64 = 40.0;

    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: ParameterId) -> &RangedValue {
        match id {
            ParameterId::Window => &self.window,
            ParameterId::Level => &self.level,
            ParameterId::Slice => &self.slice,
            ParameterId::Zoom => &self.zoom,
            ParameterId::ThresholdLower => &self.threshold_lower,
            ParameterId::ThresholdUpper => &self.threshold_upper,
            ParameterId::Opacity => &self.opacity,
            ParameterId::Brightness => &self.brightness,
            ParameterId::Contrast => &self.contrast,
            ParameterId::Sigma => &self.sigma,
            ParameterId::KernelSize => &self.kernel_size,
        }
    }

    fn slot_mut(&mut self, id: ParameterId) -> &mut RangedValue {
        match id {
            ParameterId::Window => &mut self.window,
            ParameterId::Level => &mut self.level,
            ParameterId::Slice => &mut self.slice,
            ParameterId::Zoom => &mut self.zoom,
            ParameterId::ThresholdLower => &mut self.threshold_lower,
            ParameterId::ThresholdUpper => &mut self.threshold_upper,
            ParameterId::Opacity => &mut self.opacity,
            ParameterId::Brightness => &mut self.brightness,
            ParameterId::Contrast => &mut self.contrast,
            ParameterId::Sigma => &mut self.sigma,
            ParameterId::KernelSize => &mut self.kernel_size,
        }
    }

    pub fn value(&self, id: ParameterId) -> f64 {
        self.slot(id).value()
    }

    pub fn range(&self, id: ParameterId) -> (f64, f64) {
        self.slot(id).range()
    }

    pub fn slider_position(&self, id: ParameterId) -> i32 {
        self.slot(id).slider_position()
    }

    /// Spin-box side of a control.
    pub fn set_value(&mut self, id: ParameterId, value: f64) -> bool {
        let value = match id {
            ParameterId::KernelSize => nearest_odd(value),
            ParameterId::Slice => value.round(),
            _ => value,
        };
        let changed = self.slot_mut(id).set(value);
        if changed {
            self.after_change(id);
        }
        changed
    }

    /// Slider side of a control.
    pub fn set_from_slider(&mut self, id: ParameterId, position: i32) -> bool {
        let scale = self.slot(id).slider_scale;
        self.set_value(id, position as f64 / scale)
    }

    fn after_change(&mut self, id: ParameterId) {
        // keep lower <= upper by pushing the partner along
        match id {
            ParameterId::ThresholdLower
                if self.threshold_lower.value > self.threshold_upper.value =>
            {
                let lower = self.threshold_lower.value;
                self.threshold_upper.set(lower);
                self.threshold_lower.set(self.threshold_upper.value);
            }
            ParameterId::ThresholdUpper
                if self.threshold_upper.value < self.threshold_lower.value =>
            {
                let upper = self.threshold_upper.value;
                self.threshold_lower.set(upper);
                self.threshold_upper.set(self.threshold_lower.value);
            }
            _ => {}
        }
        let event = self.event_for(id);
        self.events.emit(&event);
    }

    fn event_for(&self, id: ParameterId) -> ParameterEvent {
        match id {
            ParameterId::Window | ParameterId::Level => ParameterEvent::WindowLevelChanged {
                window: self.window.value,
                level: self.level.value,
            },
            ParameterId::Slice => ParameterEvent::SliceChanged(self.slice.value as usize),
            ParameterId::Zoom => ParameterEvent::ZoomChanged(self.zoom.value),
            ParameterId::ThresholdLower | ParameterId::ThresholdUpper => {
                ParameterEvent::ThresholdChanged {
                    lower: self.threshold_lower.value,
                    upper: self.threshold_upper.value,
                }
            }
            ParameterId::Opacity => ParameterEvent::OpacityChanged(self.opacity.value),
            ParameterId::Brightness => {
                ParameterEvent::BrightnessChanged(self.brightness.value as i32)
            }
            ParameterId::Contrast => ParameterEvent::ContrastChanged(self.contrast.value as i32),
            ParameterId::Sigma => ParameterEvent::SigmaChanged(self.sigma.value),
            ParameterId::KernelSize => {
                ParameterEvent::KernelSizeChanged(self.kernel_size.value as usize)
            }
        }
    }

    pub fn window_level(&self) -> (f64, f64) {
        (self.window.value, self.level.value)
    }

    /// Sets both halves at once and emits a single notification.
    pub fn set_window_level(&mut self, window: f64, level: f64) {
        let changed = self.window.set(window) | self.level.set(level);
        if changed {
            let event = self.event_for(ParameterId::Window);
            self.events.emit(&event);
        }
    }

    pub fn set_slice_range(&mut self, max: usize) {
        self.slice.set_range(0.0, max as f64);
    }

    pub fn slice(&self) -> usize {
        self.slice.value as usize
    }

    pub fn zoom(&self) -> f64 {
        self.zoom.value
    }

    pub fn threshold(&self) -> (f64, f64) {
        (self.threshold_lower.value, self.threshold_upper.value)
    }

    pub fn set_threshold_range(&mut self, min: f64, max: f64) {
        self.threshold_lower.set_range(min, max);
        self.threshold_upper.set_range(min, max);
    }

    pub fn sigma(&self) -> f64 {
        self.sigma.value
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size.value as usize
    }

    pub fn colormap(&self) -> Colormap {
        self.colormap
    }

    pub fn set_colormap(&mut self, colormap: Colormap) {
        if self.colormap != colormap {
            self.colormap = colormap;
            self.events.emit(&ParameterEvent::ColormapChanged(colormap));
        }
    }

    pub fn invert_colors(&self) -> bool {
        self.invert_colors
    }

    pub fn set_invert_colors(&mut self, invert: bool) {
        if self.invert_colors != invert {
            self.invert_colors = invert;
            self.events.emit(&ParameterEvent::InvertColorsChanged(invert));
        }
    }

    pub fn view_type(&self) -> ViewType {
        self.view_type
    }

    pub fn set_view_type(&mut self, view_type: ViewType) {
        if self.view_type != view_type {
            self.view_type = view_type;
            self.events.emit(&ParameterEvent::ViewTypeChanged(view_type));
        }
    }

    pub fn filter_type(&self) -> FilterKind {
        self.filter_type
    }

    pub fn set_filter_type(&mut self, filter_type: FilterKind) {
        if self.filter_type != filter_type {
            self.filter_type = filter_type;
            self.events.emit(&ParameterEvent::FilterTypeChanged(filter_type));
        }
    }

    pub fn registration(&self) -> &RegistrationParameters {
        &self.registration
    }

    pub fn set_fixed_image(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if self.registration.fixed_image.as_ref() != Some(&path) {
            self.registration.fixed_image = Some(path.clone());
            self.events.emit(&ParameterEvent::FixedImageChanged(path));
        }
    }

    pub fn set_moving_image(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if self.registration.moving_image.as_ref() != Some(&path) {
            self.registration.moving_image = Some(path.clone());
            self.events.emit(&ParameterEvent::MovingImageChanged(path));
        }
    }

    pub fn set_registration_algorithm(&mut self, algorithm: RegistrationKind) {
        if self.registration.algorithm != Some(algorithm) {
            self.registration.algorithm = Some(algorithm);
            self.events
                .emit(&ParameterEvent::RegistrationAlgorithmChanged(algorithm));
        }
    }

    /// Emits the request matching the selected filter type.
    pub fn request_filter(&self) {
        let event = match self.filter_type {
            FilterKind::Gaussian => ParameterEvent::GaussianFilterRequested {
                sigma: self.sigma(),
                kernel_size: self.kernel_size(),
            },
            FilterKind::Median => ParameterEvent::MedianFilterRequested {
                kernel_size: self.kernel_size(),
            },
            FilterKind::Sharpen => ParameterEvent::SharpenFilterRequested,
        };
        self.events.emit(&event);
    }

    pub fn request_registration(&self) {
        self.events.emit(&ParameterEvent::StartRegistrationRequested);
    }

    pub fn reset_registration(&mut self) {
        self.registration = RegistrationParameters::default();
        self.events.emit(&ParameterEvent::ResetRegistrationRequested);
    }

    pub fn select_measurement_tool(&self, tool: MeasurementTool) {
        self.events.emit(&ParameterEvent::MeasurementToolSelected(tool));
    }

    pub fn clear_measurements(&self) {
        self.events.emit(&ParameterEvent::ClearMeasurementsRequested);
    }

    pub fn reset_zoom(&mut self) {
        self.zoom.set(1.0);
        self.events.emit(&ParameterEvent::ResetZoomRequested);
    }

    /// Restores defaults. Ranges derived from the loaded volume are kept.
    pub fn reset_parameters(&mut self) {
        let defaults = Self::default();
        self.window.set(defaults.window.value);
        self.level.set(defaults.level.value);
        self.slice.set(0.0);
        self.zoom = defaults.zoom;
        let (lower, upper) = self.threshold_lower.range();
        self.threshold_lower.set(lower);
        self.threshold_upper.set(upper);
        self.opacity = defaults.opacity;
        self.brightness = defaults.brightness;
        self.contrast = defaults.contrast;
        self.sigma = defaults.sigma;
        self.kernel_size = defaults.kernel_size;
        self.colormap = defaults.colormap;
        self.invert_colors = defaults.invert_colors;
        self.view_type = defaults.view_type;
        self.filter_type = defaults.filter_type;
        self.events.emit(&ParameterEvent::Reset);
    }
}

fn nearest_odd(value: f64) -> f64 {
    let v = value.round();
    if (v as i64) % 2 == 0 { v + 1.0 } else { v }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::EventLog;
    use approx::assert_relative_eq;

    #[test]
    fn slider_and_spin_box_share_one_value() {
        let mut params = ParameterState::new();
        assert!(params.set_from_slider(ParameterId::Zoom, 250));
        assert_relative_eq!(params.zoom(), 2.5);

        assert!(params.set_value(ParameterId::Zoom, 0.75));
        assert_eq!(params.slider_position(ParameterId::Zoom), 75);
    }

    #[test]
    fn values_clamp_to_range() {
        let mut params = ParameterState::new();
        params.set_value(ParameterId::Zoom, 50.0);
        assert_relative_eq!(params.zoom(), 5.0);
        params.set_value(ParameterId::Window, -3.0);
        assert_relative_eq!(params.value(ParameterId::Window), 1.0);
    }

    #[test]
    fn lower_threshold_pushes_upper() {
        let mut params = ParameterState::new();
        params.set_value(ParameterId::ThresholdUpper, 100.0);
        params.set_value(ParameterId::ThresholdLower, 150.0);
        assert_eq!(params.threshold(), (150.0, 150.0));

        params.set_value(ParameterId::ThresholdUpper, 20.0);
        assert_eq!(params.threshold(), (20.0, 20.0));
    }

    #[test]
    fn unchanged_values_stay_silent() {
        let mut params = ParameterState::new();
        let log = EventLog::new();
        log.attach(&mut params.events);

        assert!(!params.set_value(ParameterId::Window, 400.0));
        params.set_window_level(400.0, 40.0);
        assert!(log.drain().is_empty());

        params.set_window_level(800.0, 40.0);
        assert_eq!(
            log.drain(),
            vec![ParameterEvent::WindowLevelChanged {
                window: 800.0,
                level: 40.0
            }]
        );
    }

    #[test]
    fn kernel_size_snaps_to_odd() {
        let mut params = ParameterState::new();
        params.set_value(ParameterId::KernelSize, 6.0);
        assert_eq!(params.kernel_size(), 7);
        params.set_value(ParameterId::KernelSize, 100.0);
        assert_eq!(params.kernel_size(), 15);
    }

    #[test]
    fn filter_request_carries_current_parameters() {
        let mut params = ParameterState::new();
        params.set_value(ParameterId::Sigma, 2.0);
        params.set_filter_type(FilterKind::Median);
        let log = EventLog::new();
        log.attach(&mut params.events);
        params.request_filter();
        assert_eq!(
            log.drain(),
            vec![ParameterEvent::MedianFilterRequested { kernel_size: 3 }]
        );
    }

    #[test]
    fn reset_keeps_slice_range() {
        let mut params = ParameterState::new();
        params.set_slice_range(20);
        params.set_value(ParameterId::Slice, 12.0);
        params.set_window_level(1000.0, 300.0);
        params.reset_parameters();
        assert_eq!(params.slice(), 0);
        assert_eq!(params.range(ParameterId::Slice), (0.0, 20.0));
        assert_eq!(params.window_level(), (400.0, 40.0));
    }
}
