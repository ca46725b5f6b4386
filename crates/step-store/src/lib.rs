//! Persistence for saga step metadata and per-saga aggregate state.
//!
//! Every write goes through [`StepStore::save`], a single compare-and-write
//! per [`StepKey`]. Two concurrent deliveries of the same message can never
//! both create the same step record.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod saga_data;
pub mod step;
pub mod store;

pub use common::{MessageId, SagaId};
pub use error::{Result, StepStoreError};
pub use memory::InMemoryStepStore;
pub use postgres::PostgresStepStore;
pub use saga_data::SagaData;
pub use step::{SagaStepMetadata, StepKey, StepStatus, UnknownStepStatus};
pub use store::{
    Expectation, SAGA_DATA_MAX_ATTEMPTS, SaveOptions, StepStore, StepStoreExt, validate_for_save,
};
