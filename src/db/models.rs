//! Row types for images and groups.

/// A stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: i64,
    pub path: String,
    pub bytes: u64,
    pub hash: String,
    pub processed: bool,
    pub group_id: Option<i64>,
}

/// An image produced by the hashing pipeline, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    pub path: String,
    pub hash: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub id: i64,
    /// Hash of the image that founded the group.
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct GroupWithImages {
    pub group: GroupRecord,
    pub images: Vec<ImageRecord>,
}

impl GroupWithImages {
    /// The biggest file in the group, first by id on ties.
    pub fn largest_image(&self) -> Option<&ImageRecord> {
        self.images
            .iter()
            .rev()
            .max_by_key(|image| image.bytes)
    }
}

/// The fields of an image a worker needs to look for matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: i64,
    pub hash: String,
}

impl From<&ImageRecord> for Candidate {
    fn from(image: &ImageRecord) -> Self {
        Self {
            id: image.id,
            hash: image.hash.clone(),
        }
    }
}

/// A row id with its edit distance to a query hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistanceRow {
    pub id: i64,
    pub distance: u32,
}
