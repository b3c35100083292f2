pub mod billing;
pub mod config;
pub mod prediction;
pub mod processor;
pub mod supervisor;

pub use billing::{BillingGate, HttpLedger, Ledger, LedgerError};
pub use config::{BillingConfig, PredictionConfig, SupervisorConfig, WorkerConfig};
pub use prediction::{
    wait_for_prediction, PollPolicy, Prediction, PredictionError, PredictionProvider,
    PredictionStatus, ReplicateClient,
};
pub use processor::{GenerationProcessor, ProcessingError};
pub use supervisor::{ExecSpawner, Supervisor, WorkerSpawner};
