//! In-memory output sink (testing only)
//!
//! [`MemorySink`] keeps every delivered document instead of writing it
//! anywhere, so callers can inspect what a merge produced.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{Delivery, OutputSink};
use crate::error::AdapterError;

/// One document handed to a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Sink that keeps every delivered document, in delivery order.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<Delivered>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of everything delivered so far.
    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn deliver(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<Delivery, AdapterError> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Delivered {
                file_name: suggested_name.to_string(),
                bytes,
            });
        Ok(Delivery {
            file_name: suggested_name.to_string(),
            path: None,
        })
    }
}
