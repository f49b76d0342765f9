use std::fmt;
use std::sync::Arc;

/// An immutable snapshot of model parameters.
///
/// Cloning shares the blob.
#[derive(Clone, PartialEq, Eq)]
pub struct WeightVersion {
    version: u64,
    step: u64,
    params: Arc<[u8]>,
}

impl WeightVersion {
    pub(crate) fn new(version: u64, step: u64, params: Arc<[u8]>) -> Self {
        Self { version, step, params }
    }

    /// Version 0: the weights actors start from.
    pub fn initial(params: impl Into<Arc<[u8]>>) -> Self {
        Self::new(0, 0, params.into())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Optimizer step that produced these weights.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }
}

// Blobs can be large; print their size only
impl fmt::Debug for WeightVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightVersion")
            .field("version", &self.version)
            .field("step", &self.step)
            .field("params_len", &self.params.len())
            .finish()
    }
}
