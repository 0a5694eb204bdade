//! Integration tests for the object-store backend over S3.
//!
//! These tests require a running S3-compatible storage (LocalStack/MinIO)
//! with conditional writes (`If-None-Match`/`If-Match` on `PutObject`).
//! Run: docker run -d -p 4566:4566 localstack/localstack
//! Then: cargo test --features integration --test integration

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;
#[cfg(feature = "integration")]
mod conformance;
mod lease;
