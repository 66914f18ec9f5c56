use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// A FIFO of body chunks that can be drained chunk-by-chunk or flattened.
#[derive(Debug, Default, Clone)]
pub struct BufList {
	bufs: VecDeque<Bytes>,
	remaining: usize,
}

impl BufList {
	pub fn push(&mut self, data: Bytes) {
		if data.is_empty() {
			return;
		}
		self.remaining += data.len();
		self.bufs.push_back(data);
	}

	pub fn pop_front(&mut self) -> Option<Bytes> {
		let data = self.bufs.pop_front()?;
		self.remaining -= data.len();
		Some(data)
	}

	pub fn remaining(&self) -> usize {
		self.remaining
	}

	pub fn has_remaining(&self) -> bool {
		self.remaining > 0
	}

	/// Flattens the queued chunks into one contiguous buffer without draining.
	pub fn copy_to_bytes(&self) -> Bytes {
		if self.bufs.len() == 1 {
			return self.bufs[0].clone();
		}
		let mut out = BytesMut::with_capacity(self.remaining);
		for chunk in &self.bufs {
			out.extend_from_slice(chunk.chunk());
		}
		out.freeze()
	}
}
