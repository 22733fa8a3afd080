mod common;

use std::time::{Duration, Instant};

use common::{WAIT, mpeg_frames, player, ramp, small_config, wait_event, wait_state, wave};
use stream_player::{
    ConverterInitError, DeviceError, FormatHint, FormatOpenError, ParseError, PlaybackState,
    Player, PlayerError, PlayerEvent, Pull,
};

/// Feed `bytes` split at `splits`, finish, and return everything the device would play.
fn play_chunked(bytes: &[u8], splits: &[usize]) -> (Vec<f32>, Player) {
    let (player, events, output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();
    player.play().unwrap();

    let mut start = 0;
    for &len in splits {
        player.feed(&bytes[start..start + len], false).unwrap();
        start += len;
    }
    assert_eq!(start, bytes.len());
    player.finish().unwrap();

    assert!(wait_event(&events, |e| matches!(e, PlayerEvent::InputDrained)).is_some());
    assert!(wait_state(&player, PlaybackState::Playing));
    (output.drain(), player)
}

#[test]
fn chunking_does_not_change_decoded_audio() {
    // 44-byte header + 2493 mono frames = 5030 bytes.
    let bytes = wave(1, 1, 44_100, &ramp(2493));
    assert_eq!(bytes.len(), 5030);

    let (split, split_player) = play_chunked(&bytes, &[10, 20, 5000]);
    let (whole, _) = play_chunked(&bytes, &[5030]);

    assert_eq!(split.len(), 2493);
    assert_eq!(split, whole);
    assert!((split[0] - (-10_000.0 / 32_768.0)).abs() < 1e-6);

    let stats = split_player.stats();
    assert_eq!(stats.bytes_parsed, 5030);
    assert_eq!(stats.packets_parsed, 3);
    assert_eq!(stats.pending_packets, 0);
    assert_eq!(stats.conversion_failures, 0);
    assert_eq!(stats.output_format.map(|f| f.sample_rate), Some(44_100));
}

#[test]
fn play_before_priming_starts_once_primed() {
    let (player, events, output) = player(small_config());
    player.open(FormatHint::Mime("audio/wav".to_string())).unwrap();
    player.play().unwrap();
    assert_eq!(output.state.lock().started, 0);

    player
        .feed(&wave(1, 2, 48_000, &ramp(2 * 4096)), false)
        .unwrap();

    let mut seen = Vec::new();
    let playing = wait_event(&events, |e| {
        if let PlayerEvent::StateChanged { to, .. } = e {
            seen.push(*to);
            return *to == PlaybackState::Playing;
        }
        false
    });
    assert!(playing.is_some());
    assert_eq!(
        seen,
        vec![
            PlaybackState::AwaitingFormat,
            PlaybackState::AwaitingData,
            PlaybackState::Primed,
            PlaybackState::Playing,
        ]
    );
    assert_eq!(output.state.lock().started, 1);
}

#[test]
fn stop_inside_device_pull_pauses_next_pull() {
    let (player, _events, output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();
    player.play().unwrap();
    player
        .feed(&wave(1, 1, 44_100, &ramp(8 * 512)), false)
        .unwrap();
    assert!(wait_state(&player, PlaybackState::Playing));

    let feed = output.feed().unwrap();
    let held = match feed.pull() {
        Pull::Ready(buffer) => buffer,
        other => panic!("expected audio, got {other:?}"),
    };
    // Still holding a pulled buffer, as a device callback would.
    player.stop();
    assert!(matches!(feed.pull(), Pull::Paused));
    drop(held);

    assert!(wait_state(&player, PlaybackState::Stopped));
    assert!(matches!(feed.pull(), Pull::Paused));
}

#[test]
fn play_from_stopped_resumes_without_repriming() {
    let (player, _events, output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();
    player
        .feed(&wave(1, 1, 44_100, &ramp(6 * 512)), false)
        .unwrap();
    assert!(wait_state(&player, PlaybackState::Primed));

    player.play().unwrap();
    assert!(wait_state(&player, PlaybackState::Playing));
    player.stop();
    assert!(wait_state(&player, PlaybackState::Stopped));
    let queued = player.stats().buffered;
    assert!(queued > 0);

    player.play().unwrap();
    assert!(wait_state(&player, PlaybackState::Playing));
    let state = output.state.lock();
    assert_eq!(state.opened, 1);
    assert_eq!(state.started, 2);
    assert_eq!(state.paused, 1);
    drop(state);
    assert!(matches!(output.feed().unwrap().pull(), Pull::Ready(_)));
}

#[test]
fn stop_then_play_back_to_back_keeps_playing() {
    let (player, events, output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();
    player.play().unwrap();
    player
        .feed(&wave(1, 1, 44_100, &ramp(8 * 512)), false)
        .unwrap();
    assert!(wait_state(&player, PlaybackState::Playing));

    for _ in 0..10 {
        player.stop();
        player.play().unwrap();
        // The pause's not-running report lands after the restart.
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(player.state(), PlaybackState::Playing);
    }
    assert!(
        !events
            .try_iter()
            .any(|e| matches!(e, PlayerEvent::Failed { .. }))
    );
    let state = output.state.lock();
    assert_eq!(state.started, 11);
    assert_eq!(state.paused, 10);
}

#[test]
fn repeated_stop_never_blocks_and_settles_stopped() {
    let (player, events, _output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();
    player.play().unwrap();
    player
        .feed(&wave(1, 1, 44_100, &ramp(8 * 512)), false)
        .unwrap();
    assert!(wait_state(&player, PlaybackState::Playing));

    // Far more than the control queue holds.
    for _ in 0..5_000 {
        player.stop();
    }
    assert!(wait_state(&player, PlaybackState::Stopped));

    player.play().unwrap();
    assert!(wait_state(&player, PlaybackState::Playing));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(player.state(), PlaybackState::Playing);
    assert!(
        !events
            .try_iter()
            .any(|e| matches!(e, PlayerEvent::Failed { .. }))
    );
}

#[test]
fn stop_while_primed_moves_to_stopped() {
    let (player, _events, output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();
    player
        .feed(&wave(1, 1, 44_100, &ramp(4 * 512)), false)
        .unwrap();
    assert!(wait_state(&player, PlaybackState::Primed));

    player.stop();
    assert!(wait_state(&player, PlaybackState::Stopped));
    // Never started, so nothing to pause.
    assert_eq!(output.state.lock().paused, 0);
}

#[test]
fn bad_header_fails_open_and_later_calls_report_no_session() {
    let (player, events, _output) = player(small_config());
    let err = player
        .open(FormatHint::Header(vec![0x00, 0x01, 0x02, 0x03]))
        .unwrap_err();
    assert!(matches!(
        err,
        PlayerError::FormatOpen(FormatOpenError::UnrecognizedHeader { len: 4 })
    ));

    assert!(matches!(
        player.feed(&[0u8; 16], false),
        Err(PlayerError::SessionNotStarted)
    ));
    assert!(matches!(player.play(), Err(PlayerError::SessionNotStarted)));

    let failed = wait_event(&events, |e| matches!(e, PlayerEvent::Failed { .. }));
    assert!(matches!(
        failed,
        Some(PlayerEvent::Failed {
            error: PlayerError::FormatOpen(_),
            ..
        })
    ));
    assert!(wait_state(&player, PlaybackState::Failed));
}

#[test]
fn parse_error_tears_down_session_until_reopened() {
    let (player, events, _output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();
    let err = player.feed(b"RIFX\0\0\0\0WAVEfmt ", false).unwrap_err();
    assert!(matches!(err, PlayerError::Parse(ParseError::BadMagic)));
    assert!(matches!(
        player.feed(&[0u8; 4], false),
        Err(PlayerError::SessionNotStarted)
    ));

    match wait_event(&events, |e| matches!(e, PlayerEvent::Failed { .. })) {
        Some(PlayerEvent::Failed { error, context }) => {
            assert!(matches!(error, PlayerError::Parse(ParseError::BadMagic)));
            assert_eq!(context.state, PlaybackState::AwaitingFormat);
        }
        other => panic!("expected failure, got {other:?}"),
    }

    player.open(FormatHint::Wave).unwrap();
    assert!(wait_state(&player, PlaybackState::AwaitingFormat));
    player
        .feed(&wave(1, 1, 44_100, &ramp(1024)), false)
        .unwrap();
}

#[test]
fn parse_error_reports_bytes_consumed_before_it() {
    let (player, events, _output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();

    let mut bytes = b"RIFF\0\0\0\0WAVE".to_vec();
    bytes.extend_from_slice(b"LIST");
    bytes.extend_from_slice(&600u32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 600]);
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&64u32.to_le_bytes());
    let err = player.feed(&bytes, false).unwrap_err();
    assert!(matches!(err, PlayerError::Parse(ParseError::DataBeforeFormat)));

    match wait_event(&events, |e| matches!(e, PlayerEvent::Failed { .. })) {
        Some(PlayerEvent::Failed { context, .. }) => {
            assert_eq!(context.byte_offset, 12 + 8 + 600);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn persistent_conversion_failures_fail_the_session() {
    let mut config = small_config();
    config.max_consecutive_failures = 3;
    let (player, events, _output) = player(config);
    player.open(FormatHint::Mpeg).unwrap();
    player.play().unwrap();
    // Well-formed frame headers around undecodable side info.
    player.feed(&mpeg_frames(8), false).unwrap();

    match wait_event(&events, |e| matches!(e, PlayerEvent::Failed { .. })) {
        Some(PlayerEvent::Failed { error, context }) => {
            assert!(matches!(
                error,
                PlayerError::PersistentConversion { failures: 4, .. }
            ));
            assert_eq!(context.state, PlaybackState::AwaitingData);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(wait_state(&player, PlaybackState::Failed));
    assert!(player.stats().conversion_failures >= 4);
    assert!(matches!(
        player.feed(&mpeg_frames(1), false),
        Err(PlayerError::SessionNotStarted)
    ));
}

#[test]
fn unsupported_wave_encoding_fails_converter_init() {
    let (player, events, _output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();
    // 0x0002 is MS ADPCM.
    player
        .feed(&wave(0x0002, 1, 22_050, &ramp(256)), false)
        .unwrap();

    let failed = wait_event(&events, |e| matches!(e, PlayerEvent::Failed { .. }));
    assert!(matches!(
        failed,
        Some(PlayerEvent::Failed {
            error: PlayerError::ConverterInit(ConverterInitError::Unsupported(_)),
            ..
        })
    ));
    assert!(wait_state(&player, PlaybackState::Failed));
    assert!(matches!(
        player.feed(&[0u8; 4], false),
        Err(PlayerError::SessionNotStarted)
    ));
}

#[test]
fn device_stopping_while_playing_fails_the_session() {
    let (player, events, output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();
    player.play().unwrap();
    player
        .feed(&wave(1, 1, 44_100, &ramp(4 * 512)), false)
        .unwrap();
    assert!(wait_state(&player, PlaybackState::Playing));

    output.feed().unwrap().notify_running(false);

    match wait_event(&events, |e| matches!(e, PlayerEvent::Failed { .. })) {
        Some(PlayerEvent::Failed { error, context }) => {
            assert!(matches!(
                error,
                PlayerError::Device(DeviceError::StoppedUnexpectedly)
            ));
            assert_eq!(context.state, PlaybackState::Playing);
            assert_eq!(context.byte_offset, 44 + 4 * 512 * 2);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(wait_state(&player, PlaybackState::Failed));
}

#[test]
fn device_open_failure_is_fatal() {
    let (player, events, output) = player(small_config());
    output.state.lock().fail_open = true;
    player.open(FormatHint::Wave).unwrap();
    player
        .feed(&wave(1, 1, 44_100, &ramp(1024)), false)
        .unwrap();

    let failed = wait_event(&events, |e| matches!(e, PlayerEvent::Failed { .. }));
    assert!(matches!(
        failed,
        Some(PlayerEvent::Failed {
            error: PlayerError::Device(DeviceError::Open(_)),
            ..
        })
    ));
    assert!(wait_state(&player, PlaybackState::Failed));
}

#[test]
fn short_clip_primes_at_end_of_input() {
    let mut config = small_config();
    config.prime_buffers = 4;
    let (player, events, output) = player(config);
    player.open(FormatHint::Wave).unwrap();
    player.play().unwrap();
    // Less than one full buffer of audio.
    player.feed(&wave(1, 1, 44_100, &ramp(100)), false).unwrap();
    player.finish().unwrap();

    assert!(wait_event(&events, |e| matches!(e, PlayerEvent::InputDrained)).is_some());
    assert!(wait_state(&player, PlaybackState::Playing));
    assert_eq!(output.drain().len(), 100);
    assert!(matches!(player.feed(&[0u8; 2], false), Err(PlayerError::InputFinished)));
}

#[test]
fn reopening_replaces_the_session() {
    let (player, _events, output) = player(small_config());
    player.open(FormatHint::Wave).unwrap();
    player
        .feed(&wave(1, 1, 44_100, &ramp(4 * 512)), false)
        .unwrap();
    assert!(wait_state(&player, PlaybackState::Primed));

    player.open(FormatHint::Wave).unwrap();
    assert!(wait_state(&player, PlaybackState::AwaitingFormat));
    assert_eq!(player.stats().bytes_parsed, 0);

    player
        .feed(&wave(1, 2, 48_000, &ramp(2 * 4 * 512)), false)
        .unwrap();
    assert!(wait_state(&player, PlaybackState::Primed));
    let state = output.state.lock();
    assert_eq!(state.opened, 2);
    assert_eq!(state.format.map(|f| f.channels), Some(2));
}

#[test]
fn backlog_builds_while_output_is_idle_and_clears_once_playing() {
    let mut config = small_config();
    config.max_pending_packets = 4;
    let (player, _events, output) = player(config);
    player.open(FormatHint::Wave).unwrap();

    // 20 packets; the pool holds 8 packets' worth of audio.
    let report = player
        .feed(&wave(1, 1, 44_100, &ramp(20 * 1024)), false)
        .unwrap();
    assert_eq!(report.packets, 20);
    assert!(wait_state(&player, PlaybackState::Primed));
    std::thread::sleep(Duration::from_millis(50));
    assert!(player.is_backlogged());
    assert!(player.stats().pending_packets >= 4);

    player.play().unwrap();
    assert!(wait_state(&player, PlaybackState::Playing));
    let deadline = Instant::now() + WAIT;
    while player.is_backlogged() && Instant::now() < deadline {
        output.drain();
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(!player.is_backlogged());
}
