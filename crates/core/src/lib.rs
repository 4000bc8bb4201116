pub mod backend;
pub mod kv_cache;
pub mod mapping;
pub mod model;
pub mod request;
pub mod sampler;
pub mod sampling;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
