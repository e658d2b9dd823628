//! Embedder Interface
//!
//! Boundary to the face detection / inference stage. The engine only ever
//! asks for one face per image: its embedding plus the detector's view of it.

use hashbrown::HashMap;
use parking_lot::RwLock;
use thiserror::Error;

/// Why an image produced no usable embedding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbedderError {
    #[error("No face detected")]
    NoFaceDetected,

    #[error("Multiple faces detected")]
    MultipleFacesDetected,

    #[error("Cannot read image: {0}")]
    UnreadableImage(String),
}

/// Where the detector found a face
#[derive(Debug, Clone, PartialEq)]
pub struct FaceInfo {
    /// `[x1, y1, x2, y2]` in image pixels
    pub bbox: [f32; 4],
    /// Facial keypoints as `[x, y]`; empty when the detector reports none
    pub landmarks: Vec<[f32; 2]>,
    pub det_score: f32,
}

impl Default for FaceInfo {
    fn default() -> Self {
        Self {
            bbox: [0.0; 4],
            landmarks: Vec::new(),
            // Detectors without a confidence output count as certain
            det_score: 1.0,
        }
    }
}

/// One extracted face
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub embedding: Vec<f32>,
    pub info: FaceInfo,
}

impl DetectedFace {
    pub fn new(embedding: Vec<f32>, info: FaceInfo) -> Self {
        Self { embedding, info }
    }
}

/// Maps an image to exactly one face.
///
/// Implementations wrap a detector + recognition model (e.g. an ArcFace
/// network). They must fail rather than pick one face when several are found.
pub trait Embedder: Send + Sync {
    /// Extract the single face contained in `image`.
    fn embed(&self, image: &[u8]) -> Result<DetectedFace, EmbedderError>;

    /// Output dimensionality, if fixed.
    fn dimensions(&self) -> Option<usize>;

    /// Identifier of the underlying model.
    fn model_name(&self) -> &str;
}

/// Lookup-table embedder keyed by image bytes.
///
/// Used by tests and the CLI where no inference backend is linked in.
/// Unknown images are reported as unreadable.
#[derive(Debug, Default)]
pub struct FixedEmbedder {
    faces: RwLock<HashMap<Vec<u8>, Result<DetectedFace, EmbedderError>>>,
    dimension: Option<usize>,
}

impl FixedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            faces: RwLock::new(HashMap::new()),
            dimension: Some(dimension),
        }
    }

    /// Register the embedding returned for `image`, with default detection info
    pub fn with_face(self, image: &[u8], embedding: Vec<f32>) -> Self {
        self.with_detection(image, DetectedFace::new(embedding, FaceInfo::default()))
    }

    /// Register the full detection returned for `image`
    pub fn with_detection(self, image: &[u8], face: DetectedFace) -> Self {
        self.faces.write().insert(image.to_vec(), Ok(face));
        self
    }

    /// Register a failure returned for `image`
    pub fn with_failure(self, image: &[u8], error: EmbedderError) -> Self {
        self.faces.write().insert(image.to_vec(), Err(error));
        self
    }
}

impl Embedder for FixedEmbedder {
    fn embed(&self, image: &[u8]) -> Result<DetectedFace, EmbedderError> {
        match self.faces.read().get(image) {
            Some(result) => result.clone(),
            None => Err(EmbedderError::UnreadableImage(format!(
                "{} unrecognised bytes",
                image.len()
            ))),
        }
    }

    fn dimensions(&self) -> Option<usize> {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "fixed"
    }
}
