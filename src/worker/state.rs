use std::collections::BTreeSet;
use std::sync::Arc;

use super::protocol::{ConsumerId, DecodedGop};
use crate::error::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GopState {
    #[default]
    None,
    Loading,
    Loaded,
    Decoding,
    Decoded,
    Error,
}

/// What dropping a user did to the GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// The consumer was not a user; nothing changed.
    NotHeld,
    StillWanted,
    /// Last user left a decoded GOP; its buffers were freed.
    Evicted,
    /// Last user left mid-decode. The output is discarded unless the GOP
    /// is wanted again before the decode finishes.
    Aborted,
    /// Last user left a GOP holding no decoded buffers.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStart {
    Spawn,
    /// A decode abandoned earlier is still running and becomes wanted again.
    Adopt,
}

#[derive(Debug)]
pub enum DecodeOutcome {
    Delivered(Arc<DecodedGop>),
    Discarded,
    Failed(Arc<Error>, Vec<ConsumerId>),
}

/// Per-GOP lifecycle. Pure bookkeeping: the actor drives it and performs
/// the side effects.
#[derive(Debug, Default)]
pub struct GopSlot {
    state: GopState,
    users: BTreeSet<ConsumerId>,
    resident: bool,
    in_flight: bool,
    decoded: Option<Arc<DecodedGop>>,
    error: Option<Arc<Error>>,
}

impl GopSlot {
    pub fn state(&self) -> GopState {
        self.state
    }

    pub fn users(&self) -> &BTreeSet<ConsumerId> {
        &self.users
    }

    pub fn is_wanted(&self) -> bool {
        !self.users.is_empty()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn decoded(&self) -> Option<&Arc<DecodedGop>> {
        self.decoded.as_ref()
    }

    pub fn error(&self) -> Option<&Arc<Error>> {
        self.error.as_ref()
    }

    pub fn add_user(&mut self, consumer: ConsumerId) -> bool {
        self.users.insert(consumer)
    }

    pub fn remove_user(&mut self, consumer: ConsumerId) -> Released {
        if !self.users.remove(&consumer) {
            return Released::NotHeld;
        }
        if !self.users.is_empty() {
            return Released::StillWanted;
        }
        match self.state {
            GopState::Decoded => {
                self.decoded = None;
                self.state = GopState::Loaded;
                Released::Evicted
            }
            GopState::Decoding => {
                self.state = GopState::Loaded;
                Released::Aborted
            }
            _ => Released::Idle,
        }
    }

    /// `Error -> None/Loaded`, so the next request runs the protocol afresh.
    pub fn retry(&mut self) {
        if self.state == GopState::Error {
            self.error = None;
            self.state = if self.resident {
                GopState::Loaded
            } else {
                GopState::None
            };
        }
    }

    pub fn begin_load(&mut self) -> bool {
        if self.state != GopState::None {
            return false;
        }
        self.state = GopState::Loading;
        true
    }

    pub fn load_done(&mut self) {
        self.resident = true;
        if self.state == GopState::Loading {
            self.state = GopState::Loaded;
        }
    }

    pub fn load_failed(&mut self, error: Arc<Error>) -> Vec<ConsumerId> {
        self.resident = false;
        self.fail(error)
    }

    pub fn begin_decode(&mut self) -> Option<DecodeStart> {
        if self.state != GopState::Loaded {
            return None;
        }
        self.state = GopState::Decoding;
        if self.in_flight {
            Some(DecodeStart::Adopt)
        } else {
            self.in_flight = true;
            Some(DecodeStart::Spawn)
        }
    }

    pub fn decode_done(&mut self, result: Result<DecodedGop, Error>) -> DecodeOutcome {
        self.in_flight = false;
        match result {
            Err(error) => {
                let error = Arc::new(error);
                let users = self.fail(Arc::clone(&error));
                DecodeOutcome::Failed(error, users)
            }
            // An abandoned decode is `Loaded` until someone adopts it. A new
            // user still waiting out the debounce takes its output as well.
            Ok(gop)
                if self.is_wanted()
                    && matches!(self.state, GopState::Decoding | GopState::Loaded) =>
            {
                let gop = Arc::new(gop);
                self.decoded = Some(Arc::clone(&gop));
                self.state = GopState::Decoded;
                DecodeOutcome::Delivered(gop)
            }
            // Nobody wants it any more: dropping `gop` frees the frames.
            Ok(_) => DecodeOutcome::Discarded,
        }
    }

    fn fail(&mut self, error: Arc<Error>) -> Vec<ConsumerId> {
        self.state = GopState::Error;
        self.error = Some(error);
        self.decoded = None;
        std::mem::take(&mut self.users).into_iter().collect()
    }
}
