//! Orchestration Store Client
//!
//! Typed access to the Kubernetes objects the device plugin operator reads
//! and writes: `GpuDevicePlugin` resources (spec and status subresource) and
//! the DaemonSets they own.
//!
//! # Example
//!
//! ```no_run
//! use workload_store::{KubeWorkloadStore, WorkloadStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store = KubeWorkloadStore::new(client, "inteldeviceplugins-system");
//!
//! if let Some(plugin) = store.get_plugin("gpudeviceplugin-sample").await? {
//!     println!("plugin image: {}", plugin.spec.image);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Optimistic concurrency**: every write carries the resourceVersion that
//!   was read, so concurrent edits surface as [`StoreError::Conflict`]
//! - **Minimal patches**: [`WorkloadPatch`] renders only changed fields as a
//!   strategic merge patch
//! - **Mocking**: `test-util` enables [`MockWorkloadStore`]

pub mod client;
pub mod error;
pub mod patch;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeWorkloadStore;
pub use error::StoreError;
pub use patch::{ContainerChange, InitStageChange, WorkloadPatch};
pub use store_trait::WorkloadStore;
#[cfg(feature = "test-util")]
pub use mock::MockWorkloadStore;
