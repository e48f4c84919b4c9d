//! Client-side image acquisition and caching.
//!
//! The entry point is [`ImageService`](service::ImageService), which is constructed explicitly
//! from a [`Config`](config::Config) and hands out cancellable [`LoadTask`](service::LoadTask)s.
//! Everything below it, the memory and disk tiers, ETag revalidation and request
//! deduplication, is usable on its own as well.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod codec;
pub mod config;
pub mod download;
pub mod logging;
pub mod service;
pub mod utils;

#[cfg(test)]
use imgcache_test as test;
