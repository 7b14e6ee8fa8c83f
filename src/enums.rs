use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

/// What a viewport shows. The 3D view is a maximum intensity projection
/// along the axial direction and navigates like the axial view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ViewType {
    #[default]
    Axial,
    Coronal,
    Sagittal,
    Volume3D,
}

impl ViewType {
    pub fn orientation(self) -> Orientation {
        match self {
            ViewType::Axial | ViewType::Volume3D => Orientation::Axial,
            ViewType::Coronal => Orientation::Coronal,
            ViewType::Sagittal => Orientation::Sagittal,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Interpolation {
    Bilinear,
    // TODO: trilinear reslicing for oblique planes
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Colormap {
    #[default]
    Gray,
    Rainbow,
    Hot,
    CoolWarm,
}

impl Colormap {
    pub const ALL: [Colormap; 4] = [
        Colormap::Gray,
        Colormap::Rainbow,
        Colormap::Hot,
        Colormap::CoolWarm,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Colormap::Gray => "gray",
            Colormap::Rainbow => "rainbow",
            Colormap::Hot => "hot",
            Colormap::CoolWarm => "cool-warm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationKind {
    Rigid,
    Affine,
    Deformable,
}

impl RegistrationKind {
    pub fn name(self) -> &'static str {
        match self {
            RegistrationKind::Rigid => "rigid",
            RegistrationKind::Affine => "affine",
            RegistrationKind::Deformable => "deformable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementTool {
    Distance,
    Angle,
    Area,
}
