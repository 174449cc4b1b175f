use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use bytes::Bytes;
use reqwest::StatusCode;

use crate::transport::{Body, Resume, Transport, TransportError};

/// In-memory transport that serves registered resources and records every
/// request as `(url, offset)`.
#[derive(Default)]
pub struct FakeTransport {
    resources: Mutex<HashMap<String, Bytes>>,
    requests: Mutex<Vec<(String, u64)>>,
    ignore_ranges: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, data: impl Into<Bytes>) {
        self.resources.lock().unwrap().insert(url.to_owned(), data.into());
    }

    pub fn remove(&self, url: &str) {
        self.resources.lock().unwrap().remove(url);
    }

    /// Behave like a server without range support: every request is answered
    /// with the full resource, regardless of the offset.
    pub fn ignore_ranges(&self, value: bool) {
        self.ignore_ranges.store(value, Ordering::Relaxed);
    }

    pub fn requests(&self) -> Vec<(String, u64)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests.lock().unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .count()
    }

    fn get(&self, url: &str, offset: u64) -> Result<Bytes, TransportError> {
        self.requests.lock().unwrap().push((url.to_owned(), offset));

        self.resources.lock().unwrap()
            .get(url)
            .cloned()
            .ok_or(TransportError::BadStatus(StatusCode::NOT_FOUND))
    }
}

pub struct FakeBody(Option<Bytes>);

impl Body for FakeBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.0.take())
    }
}

impl Transport for FakeTransport {
    type Body = FakeBody;

    async fn fetch(&self, url: &str) -> Result<Bytes, TransportError> {
        self.get(url, 0)
    }

    async fn fetch_from(
        &self,
        url: &str,
        offset: u64,
    ) -> Result<Resume<Self::Body>, TransportError> {
        let data = self.get(url, offset)?;

        Ok(if offset == 0 || self.ignore_ranges.load(Ordering::Relaxed) {
            Resume::Restart(FakeBody(Some(data)))
        } else if offset >= data.len() as u64 {
            Resume::Complete
        } else {
            Resume::Append(FakeBody(Some(data.slice(offset as usize..))))
        })
    }
}
