//! Correlation id generation.

use uuid::Uuid;

/// Produces correlation ids for calls that arrive without one.
pub trait IdGenerator: Send + Sync + 'static {
    fn generate(&self) -> String;
}

/// Time-ordered UUID v7 ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn generate(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

impl<F> IdGenerator for F
where
    F: Fn() -> String + Send + Sync + 'static,
{
    fn generate(&self) -> String {
        self()
    }
}
