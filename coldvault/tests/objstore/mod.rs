//! Integration tests exercising the object store implementations against live APIs.
//!
//! The Swift source is covered by unit tests against a mock HTTP server.  The S3 destination
//! needs something that speaks the S3 API, so these tests run against
//! [minio](https://min.io), which must be installed locally (in `PATH`, or wherever `MINIO_PATH`
//! points).  They're marked `ignore` so they must be explicitly invoked with `--ignored`.

mod minio;
