//! Error helpers shared by the cache engines and the transport state machine

use std::sync::Arc;

/// A failure that can be stored in a state cell and handed to many observers.
pub type SharedError = Arc<anyhow::Error>;

pub fn share(error: anyhow::Error) -> SharedError {
    Arc::new(error)
}

/// Rough class of a Web API failure, read from the error text rspotify
/// produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiFailure {
    NotFound,
    Forbidden,
    Unauthorized,
    RateLimited,
    Other,
}

pub fn classify(error: &anyhow::Error) -> ApiFailure {
    let text = error.to_string();
    if text.contains("404") || text.contains("non existing id") {
        ApiFailure::NotFound
    } else if text.contains("403") {
        ApiFailure::Forbidden
    } else if text.contains("401") {
        ApiFailure::Unauthorized
    } else if text.contains("429") {
        ApiFailure::RateLimited
    } else {
        ApiFailure::Other
    }
}

/// Whether a remote failure means the entity does not exist on the service.
pub fn is_not_found(error: &anyhow::Error) -> bool {
    classify(error) == ApiFailure::NotFound
}
