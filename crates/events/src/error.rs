use core_types::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventsError {
    #[error("Refusing to publish strategy '{0}': {1}")]
    InvalidStrategy(String, CoreError),
}
