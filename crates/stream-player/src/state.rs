use std::fmt;

/// Lifecycle of one playback session, owned by the control thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    /// No session has been opened.
    #[default]
    Initial,
    /// Parser is bound; waiting for enough header bytes to describe the stream.
    AwaitingFormat,
    /// Format known and output opened; waiting for the first decoded buffers.
    AwaitingData,
    /// Enough audio is queued to start without an audible gap.
    Primed,
    Playing,
    /// Output paused; decoded audio is kept so playback resumes without re-priming.
    Stopped,
    Failed,
}

impl PlaybackState {
    /// States in which a `play()` request is remembered rather than applied.
    pub fn defers_play(self) -> bool {
        matches!(self, PlaybackState::AwaitingFormat | PlaybackState::AwaitingData)
    }

    /// States from which output can be started immediately.
    pub fn can_start(self) -> bool {
        matches!(self, PlaybackState::Primed | PlaybackState::Stopped)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Initial => "initial",
            PlaybackState::AwaitingFormat => "awaiting-format",
            PlaybackState::AwaitingData => "awaiting-data",
            PlaybackState::Primed => "primed",
            PlaybackState::Playing => "playing",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pre_priming_states_defer_play() {
        assert!(PlaybackState::AwaitingFormat.defers_play());
        assert!(PlaybackState::AwaitingData.defers_play());
        assert!(!PlaybackState::Primed.defers_play());
        assert!(!PlaybackState::Failed.defers_play());
    }

    #[test]
    fn stopped_can_resume_without_priming() {
        assert!(PlaybackState::Stopped.can_start());
        assert!(PlaybackState::Primed.can_start());
        assert!(!PlaybackState::AwaitingData.can_start());
    }
}
