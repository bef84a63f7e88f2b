//! Ingestion pipeline: codec, bounded queue, listeners, worker pool.
//!
//! ```text
//! network -> codec -> queue -> workers -> timeseries store
//! ```
//!
//! The queue is the sole backpressure point; everything upstream of it
//! drops rather than blocks under overload.

pub mod codec;
pub mod listen;
pub mod queue;
pub mod worker;

pub use codec::{decode_batch, decode_record, DecodeError};
pub use queue::{bounded, QueueReceiver, QueueSender};
