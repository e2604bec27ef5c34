#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

/// Order in which image slices are stacked into the reference geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    /// Position of each slice projected onto the slice normal, ascending
    #[default]
    ImagePositionPatient,
    InstanceNumber,
}

/// What to do with a contour that has fewer than three distinct points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DegeneratePolicy {
    /// Log a warning and let the contour contribute no area
    #[default]
    Skip,
    /// Fail the ROI with an invalid contour error
    Reject,
}
