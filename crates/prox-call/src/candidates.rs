use prox_proto::IceCandidate;

/// Candidates held until their description is in place.
///
/// Remote candidates wait for the remote description to be applied; local
/// candidates wait until our offer or answer has been sent. Once
/// [`CandidateBuffer::release`] has been called the buffer is drained and
/// stays empty: every later candidate is handed straight back to the caller.
#[derive(Debug)]
pub struct CandidateBuffer<T = IceCandidate> {
    pending: Vec<T>,
    released: bool,
}

impl<T> Default for CandidateBuffer<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            released: false,
        }
    }
}

impl<T> CandidateBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate if it can be applied now, otherwise keeps it.
    pub fn admit(&mut self, candidate: T) -> Option<T> {
        if self.released {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Switch to pass-through and hand back everything held so far, in
    /// arrival order. Only the first call returns anything.
    pub fn release(&mut self) -> Vec<T> {
        if self.released {
            return Vec::new();
        }
        self.released = true;
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
