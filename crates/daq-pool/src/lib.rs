//! Fixed-size buffer pool for continuous acquisition channels.
//!
//! Each acquisition channel owns one [`BufferPool`]: a set of
//! [`POOL_SIZE`] pre-allocated byte buffers that circulate between a producer
//! (the poller thread filling buffers from hardware) and a consumer (the
//! caller reading completed blocks). The pool never grows; a slow consumer
//! simply starves the producer of free buffers.
//!
//! # Buffer States
//!
//! ```text
//!   free ──try_acquire_free──► in-flight ──publish_filled──► filled
//!    ▲                                                          │
//!    └────recycle──── checked-out ◄────────take_filled─────────┘
//!                          │
//!                          └──discard──► freed (pool shrinks by one)
//! ```
//!
//! Both queues live behind a single `parking_lot::Mutex`, so every
//! transition is atomic with respect to the occupancy counters and a
//! snapshot always accounts for all [`POOL_SIZE`] buffers.
//!
//! # Example
//!
//! ```
//! use daq_pool::{BufferPool, POOL_SIZE};
//!
//! let pool = BufferPool::new(800);
//!
//! // Producer side
//! let mut buf = pool.try_acquire_free().unwrap();
//! buf.as_mut_slice().fill(7);
//! buf.set_outcome(100, 0);
//! pool.publish_filled(buf);
//!
//! // Consumer side
//! let buf = pool.take_filled().unwrap();
//! assert_eq!(buf.as_slice()[0], 7);
//! pool.recycle(buf);
//!
//! assert_eq!(pool.occupancy().free, POOL_SIZE);
//! ```

pub mod buffer_pool;

pub use buffer_pool::{Buffer, BufferPool, DrainReport, MemoryLedger, Occupancy};

/// Number of buffers allocated per channel. Constant for a pool's lifetime.
pub const POOL_SIZE: usize = 5;
