use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("refusing to publish an empty parameter blob at step {step}")]
    EmptyPayload { step: u64 },
}
