//! Pipeline orchestration for one camera.
//!
//! [`PipelineSupervisor`] owns the whole per-camera machine: it builds the
//! capture and detector through injected factories, drives the frame loop
//! (read → validate → crop → detect → count/queue → persist → compose),
//! applies the reconnect policy when the stream freezes, and emits
//! [`PipelineEvent`]s for whoever is watching. Errors never cross the
//! thread boundary; they become status and log events.

pub mod logging;
pub mod supervisor;

pub use supervisor::{
    PipelineEvent, PipelineHandles, PipelineStatus, PipelineStores, PipelineSupervisor,
    ReconnectPolicy,
};
