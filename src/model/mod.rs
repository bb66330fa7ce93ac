use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::engine::{Engine, EngineKind, ModelInfo, Weights};
use crate::error::LoadError;
use crate::vocab::Vocabulary;

/// Loaded, immutable model weights.
///
/// Cloning is cheap and shares the weights. Sessions created from a handle
/// keep the weights alive, so releasing the handle early never leaves a
/// session dangling.
#[derive(Clone)]
pub struct ModelHandle {
    weights: Arc<dyn Weights>,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.weights.info();
        f.debug_struct("ModelHandle")
            .field("path", &info.path)
            .field("engine", &info.engine)
            .field("n_vocab", &info.n_vocab)
            .field("references", &Arc::strong_count(&self.weights))
            .finish()
    }
}

impl ModelHandle {
    /// Loads the model at `path` with the default engine.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        Self::load_with(EngineKind::default(), path)
    }

    /// Loads the model at `path` with the selected engine.
    ///
    /// # Arguments
    ///
    /// * `kind` - Engine to read the file with
    /// * `path` - Model file on disk
    pub fn load_with<P: AsRef<Path>>(kind: EngineKind, path: P) -> Result<Self, LoadError> {
        let engine = kind.create()?;
        Self::load_from(engine.as_ref(), path.as_ref())
    }

    pub fn load_from(engine: &dyn Engine, path: &Path) -> Result<Self, LoadError> {
        debug!(engine = engine.name(), path = %path.display(), "Loading model");
        if !path.is_file() {
            return Err(LoadError::Unreadable {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        let weights = engine.load_weights(path)?;
        info!(
            engine = engine.name(),
            path = %path.display(),
            n_vocab = weights.info().n_vocab,
            "Model loaded"
        );
        Ok(Self { weights })
    }

    pub fn vocabulary(&self) -> Vocabulary<'_> {
        Vocabulary::new(self.weights.vocab())
    }

    pub fn info(&self) -> &ModelInfo {
        self.weights.info()
    }

    pub(crate) fn weights(&self) -> &Arc<dyn Weights> {
        &self.weights
    }

    /// Whether `other` shares this handle's weights.
    pub fn same_weights(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.weights, &other.weights)
    }

    /// Gives up this reference to the weights. They are freed once no other
    /// handle clone or session holds them.
    ///
    /// # Returns
    ///
    /// `true` if the weights were freed by this call.
    pub fn release(self) -> bool {
        let path = self.weights.info().path.clone();
        let others = Arc::strong_count(&self.weights) - 1;
        drop(self.weights);
        if others == 0 {
            info!(path = %path.display(), "Model released");
            true
        } else {
            info!(path = %path.display(), remaining = others, "Model handle released, weights still referenced");
            false
        }
    }
}
