//! The in-flight write descriptor swapped atomically by
//! [`super::ConcurrentVec`]'s mutators.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

/// A descriptor's lifecycle: `Read` (no write outstanding), `WritePending`
/// (a `push_back` published a new slot value but hasn't CASed it into the
/// bucket array yet), `WriteComplete` (the CAS has been attempted, win or
/// lose).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
  Read = 0,
  WritePending = 1,
  WriteComplete = 2,
}

impl WriteState {
  fn from_u8(raw: u8) -> Self {
    match raw {
      0 => Self::Read,
      1 => Self::WritePending,
      _ => Self::WriteComplete,
    }
  }
}

/// Captures an in-flight `push_back`.
pub struct Descriptor<T> {
  pub size: usize,
  pub old_value: *mut T,
  pub new_value: *mut T,
  pub location: usize,
  state: AtomicU8,
}

impl<T> Descriptor<T> {
  pub fn read(size: usize) -> Self {
    Self {
      size,
      old_value: std::ptr::null_mut(),
      new_value: std::ptr::null_mut(),
      location: 0,
      state: AtomicU8::new(WriteState::Read as u8),
    }
  }

  pub fn write_pending(size: usize, old_value: *mut T, new_value: *mut T, location: usize) -> Self {
    Self {
      size,
      old_value,
      new_value,
      location,
      state: AtomicU8::new(WriteState::WritePending as u8),
    }
  }

  pub fn state(&self) -> WriteState {
    WriteState::from_u8(self.state.load(Ordering::Acquire))
  }

  pub fn mark_complete(&self) {
    self.state.store(WriteState::WriteComplete as u8, Ordering::Release);
  }
}
