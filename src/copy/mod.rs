//! Copy Module
//!
//! State transfer between replicas.
//!
//! ## Flow
//! ```text
//! primary                                  secondary
//! ───────                                  ─────────
//! get_current_state() ─► CopyStream
//!   next_record() ─────── bytes ─────────► set_current_state(n, bytes)
//!   ...                                      (files land in copy/)
//!   None                                   end_setting_current_state()
//!                                            (table installed, files moved)
//! ```

mod manager;
mod record;
mod stream;

pub use manager::{CopiedState, CopyManager};
pub use record::{CopyRecord, COPY_PROTOCOL_VERSION};
pub use stream::CopyStream;
