use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::signal::Signal;
use crate::transform::Transform;
use crate::volume::Volume;

pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataModelEvent {
    ImageChanged,
    MetadataChanged,
    TransformChanged,
}

/// The currently loaded image, its world transform and free-form metadata.
///
/// Setters only notify when the stored value actually changes.
#[derive(Debug, Default)]
pub struct DataModel {
    image: Option<Arc<Volume>>,
    transform: Transform,
    metadata: Metadata,
    pub events: Signal<DataModelEvent>,
}

impl DataModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_image(&mut self, image: Option<Arc<Volume>>) {
        let same = match (&self.image, &image) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if !same {
            self.image = image;
            self.events.emit(&DataModelEvent::ImageChanged);
        }
    }

    pub fn image(&self) -> Option<&Arc<Volume>> {
        self.image.as_ref()
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn set_metadata(&mut self, metadata: Metadata) {
        if self.metadata != metadata {
            self.metadata = metadata;
            self.events.emit(&DataModelEvent::MetadataChanged);
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn set_metadata_value(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if self.metadata.get(&key) != Some(&value) {
            self.metadata.insert(key, value);
            self.events.emit(&DataModelEvent::MetadataChanged);
        }
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn metadata_value_or(&self, key: &str, default: Value) -> Value {
        self.metadata.get(key).cloned().unwrap_or(default)
    }

    pub fn set_transform(&mut self, transform: Transform) {
        if self.transform != transform {
            self.transform = transform;
            self.events.emit(&DataModelEvent::TransformChanged);
        }
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Drops image and metadata and resets the transform to identity.
    pub fn clear(&mut self) {
        if self.image.take().is_some() {
            self.events.emit(&DataModelEvent::ImageChanged);
        }
        if !self.metadata.is_empty() {
            self.metadata.clear();
            self.events.emit(&DataModelEvent::MetadataChanged);
        }
        self.set_transform(Transform::identity());
    }

    pub fn is_valid(&self) -> bool {
        self.image.as_ref().is_some_and(|image| !image.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::EventLog;
    use ndarray::Array3;
    use serde_json::json;

    fn volume() -> Arc<Volume> {
        Arc::new(Volume::new(Array3::zeros((2, 2, 2)), (1.0, 1.0, 1.0)))
    }

    #[test]
    fn transform_defaults_to_identity() {
        let model = DataModel::new();
        assert!(model.transform().is_identity(0.0));
        assert!(!model.has_image());
        assert!(!model.is_valid());
    }

    #[test]
    fn setting_the_same_image_is_silent() {
        let mut model = DataModel::new();
        let log = EventLog::new();
        log.attach(&mut model.events);

        let image = volume();
        model.set_image(Some(Arc::clone(&image)));
        model.set_image(Some(image));
        assert_eq!(log.drain(), vec![DataModelEvent::ImageChanged]);
        assert!(model.is_valid());
    }

    #[test]
    fn metadata_keys_are_unique() {
        let mut model = DataModel::new();
        let log = EventLog::new();
        log.attach(&mut model.events);

        model.set_metadata_value("Modality", "CT");
        model.set_metadata_value("Modality", "CT");
        model.set_metadata_value("Modality", "MR");
        assert_eq!(model.metadata().len(), 1);
        assert_eq!(model.metadata_value("Modality"), Some(&json!("MR")));
        assert_eq!(log.drain().len(), 2);
        assert_eq!(model.metadata_value_or("missing", json!(3)), json!(3));
    }

    #[test]
    fn clear_notifies_only_changed_fields() {
        let mut model = DataModel::new();
        model.set_image(Some(volume()));
        model.set_transform(Transform::translation(1.0, 0.0, 0.0));
        let log = EventLog::new();
        log.attach(&mut model.events);

        model.clear();
        assert_eq!(
            log.drain(),
            vec![DataModelEvent::ImageChanged, DataModelEvent::TransformChanged]
        );
        assert!(model.transform().is_identity(0.0));

        model.clear();
        assert!(log.drain().is_empty());
    }
}
