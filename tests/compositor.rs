//! Compositor output, layout switching and audio metering

use std::sync::Arc;
use std::time::Duration;

use livecast::audio::{AudioLevelMonitor, MonitorConfig};
use livecast::compositor::canvas::{watermark_rect, LABEL_TEXT_RGBA};
use livecast::compositor::{CompositorConfig, Layout, StreamCompositor, PLACEHOLDER_RGBA, WATERMARK_RGBA};
use livecast::media::{
    capture_channel, CaptureBackend, MediaFrame, Resolution, SourceKind, SyntheticCapture,
    VideoFrame,
};
use livecast::peer::{
    LinkState, LoopbackNetwork, ManagerConfig, PeerConnectionManager, ViewerConfig,
    ViewerConnection, ViewerState,
};
use livecast::signaling::{MemoryRealtime, SignalingChannel};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const SMALL: Resolution = Resolution::new(64, 36);
const RED: [u8; 4] = [220, 30, 30, 255];
const BLUE: [u8; 4] = [30, 30, 220, 255];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn next_video(rx: &mut broadcast::Receiver<MediaFrame>) -> VideoFrame {
    loop {
        match rx.recv().await {
            Ok(MediaFrame::Video(frame)) => return frame,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(e) => panic!("video track closed: {}", e),
        }
    }
}

fn drain_video(rx: &mut broadcast::Receiver<MediaFrame>) -> Vec<VideoFrame> {
    let mut frames = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(MediaFrame::Video(frame)) => frames.push(frame),
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return frames,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn no_sources_still_emits_at_frame_rate() {
    init_tracing();
    let config = CompositorConfig::default()
        .output_resolution(SMALL)
        .output_frame_rate(10)
        .overlay_text("Back soon");
    let mut compositor = StreamCompositor::new(config);
    let mut rx = compositor.output().video_track().unwrap().subscribe();

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    let frames = drain_video(&mut rx);
    assert!(
        (20..=21).contains(&frames.len()),
        "unexpected frame count {}",
        frames.len()
    );

    let frame = frames.last().unwrap();
    assert_eq!(frame.resolution(), SMALL);
    assert!(frame.is_well_formed());
    assert_eq!(frame.pixel(32, 18), Some(PLACEHOLDER_RGBA));

    let (mx, my) = watermark_rect(SMALL).center();
    assert_eq!(frame.pixel(mx, my), Some(WATERMARK_RGBA));

    // Label text sits in the lower-left quarter
    let label_drawn = (SMALL.height / 2..SMALL.height)
        .flat_map(|y| (0..SMALL.width / 2).map(move |x| (x, y)))
        .any(|(x, y)| frame.pixel(x, y) == Some(LABEL_TEXT_RGBA));
    assert!(label_drawn);

    // Both overlays can be switched off live
    compositor.set_overlay_text(None);
    compositor.set_watermark(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let frame = drain_video(&mut rx).pop().unwrap();
    assert_eq!(frame.pixel(mx, my), Some(PLACEHOLDER_RGBA));
    assert!((0..SMALL.height)
        .flat_map(|y| (0..SMALL.width).map(move |x| (x, y)))
        .all(|(x, y)| frame.pixel(x, y) == Some(PLACEHOLDER_RGBA)));

    compositor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn toggling_sources_keeps_the_same_stream() {
    init_tracing();
    let compositor = StreamCompositor::new(
        CompositorConfig::default()
            .output_resolution(SMALL)
            .output_frame_rate(10)
            .watermark(false),
    );
    let output = compositor.output();
    let mut rx = output.video_track().unwrap().subscribe();

    let (feed, camera) = capture_channel(SourceKind::Camera);
    feed.push_video(VideoFrame::solid(SMALL, RED, 0));
    compositor.set_camera(Some(camera));
    drain_video(&mut rx);
    assert_eq!(next_video(&mut rx).await.pixel(32, 18), Some(RED));

    compositor.set_camera(None);
    drain_video(&mut rx);
    assert_eq!(next_video(&mut rx).await.pixel(32, 18), Some(PLACEHOLDER_RGBA));

    // An ended capture counts as absent
    let (feed, camera) = capture_channel(SourceKind::Camera);
    feed.push_video(VideoFrame::solid(SMALL, RED, 0));
    compositor.set_camera(Some(camera));
    feed.end();
    drain_video(&mut rx);
    assert_eq!(next_video(&mut rx).await.pixel(32, 18), Some(PLACEHOLDER_RGBA));

    assert!(compositor.output().same_stream(&output));
}

#[tokio::test(start_paused = true)]
async fn pip_inset_sits_bottom_right() {
    init_tracing();
    let (camera_feed, camera) = capture_channel(SourceKind::Camera);
    let (screen_feed, screen) = capture_channel(SourceKind::Screen);
    camera_feed.push_video(VideoFrame::solid(SMALL, RED, 0));
    screen_feed.push_video(VideoFrame::solid(SMALL, BLUE, 0));

    let compositor = StreamCompositor::new(
        CompositorConfig::default()
            .camera(camera)
            .screen(screen)
            .layout(Layout::PipScreenSmall)
            .output_resolution(SMALL)
            .output_frame_rate(10)
            .watermark(false),
    );
    let mut rx = compositor.output().video_track().unwrap().subscribe();

    let frame = next_video(&mut rx).await;
    assert_eq!(frame.pixel(10, 10), Some(RED));
    // 16x9 inset, one pixel from the right and bottom edges
    assert_eq!(frame.pixel(55, 30), Some(BLUE));
    assert_eq!(frame.pixel(45, 30), Some(RED));

    compositor.set_layout(Layout::Stacked);
    drain_video(&mut rx);
    let frame = next_video(&mut rx).await;
    assert_eq!(frame.pixel(32, 9), Some(RED));
    assert_eq!(frame.pixel(32, 27), Some(BLUE));
}

#[tokio::test(start_paused = true)]
async fn layout_switch_reaches_connected_viewer_without_renegotiation() {
    init_tracing();
    let (camera_feed, camera) = capture_channel(SourceKind::Camera);
    let (screen_feed, screen) = capture_channel(SourceKind::Screen);
    camera_feed.push_video(VideoFrame::solid(SMALL, RED, 0));
    screen_feed.push_video(VideoFrame::solid(SMALL, BLUE, 0));

    let compositor = StreamCompositor::new(
        CompositorConfig::default()
            .camera(camera)
            .screen(screen)
            .layout(Layout::SoloCamera)
            .output_resolution(SMALL)
            .output_frame_rate(10)
            .watermark(false),
    );
    let output = compositor.output();

    let channel = SignalingChannel::new(Arc::new(MemoryRealtime::new()));
    let network = Arc::new(LoopbackNetwork::new());
    let manager = PeerConnectionManager::start(
        "s1",
        "host",
        channel.clone(),
        network.clone(),
        output.clone(),
        ManagerConfig::default(),
    )
    .await
    .unwrap();
    let viewer = ViewerConnection::connect("s1", "v1", channel, network, ViewerConfig::default())
        .await
        .unwrap();
    viewer.wait_for_state(ViewerState::Connected).await.unwrap();
    let before = manager.link("v1").await.unwrap();

    let received = viewer.stream().unwrap();
    let mut remote = received.video_track().unwrap().subscribe();
    assert_eq!(next_video(&mut remote).await.pixel(48, 18), Some(RED));

    let mut local = output.video_track().unwrap().subscribe();
    compositor.set_layout(Layout::SideBySide);
    let frame = next_video(&mut local).await;
    assert_eq!(frame.pixel(16, 18), Some(RED));
    assert_eq!(frame.pixel(48, 18), Some(BLUE));
    // Camera is letterboxed into the left half
    assert_eq!(frame.pixel(16, 2), Some(PLACEHOLDER_RGBA));

    // The viewer sees the new geometry on the same stream
    let mut switched = false;
    for _ in 0..5 {
        if next_video(&mut remote).await.pixel(48, 18) == Some(BLUE) {
            switched = true;
            break;
        }
    }
    assert!(switched);
    assert!(compositor.output().same_stream(&output));

    let after = manager.link("v1").await.unwrap();
    assert_eq!(after.state, LinkState::Connected);
    assert_eq!(after.revision, before.revision);
    assert_eq!(after.stats.renegotiations, 0);
    assert_eq!(viewer.state(), ViewerState::Connected);
}

#[tokio::test(start_paused = true)]
async fn compositor_mixes_and_monitors_meter_synthetic_capture() {
    init_tracing();
    let backend = SyntheticCapture::new(SMALL, 10);
    let quiet = SyntheticCapture::new(SMALL, 10).tone_amplitude(0);

    let camera = backend.open(SourceKind::Camera).await.unwrap();
    let screen = quiet.open(SourceKind::Screen).await.unwrap();

    // Each window spans several capture ticks
    let meter_config = MonitorConfig::default().sample_interval(Duration::from_millis(250));
    let loud_meter = AudioLevelMonitor::start(camera.source(), meter_config.clone());
    let quiet_meter = AudioLevelMonitor::start(screen.source(), meter_config);

    let compositor = StreamCompositor::new(
        CompositorConfig::default()
            .camera(camera.source().clone())
            .screen(screen.source().clone())
            .output_resolution(SMALL)
            .output_frame_rate(10),
    );
    let mut audio = compositor.output().audio_track().unwrap().subscribe();

    tokio::time::sleep(Duration::from_millis(600)).await;

    // A sine at a quarter of full scale has an RMS of about 18
    let level = loud_meter.level();
    assert!((10..=25).contains(&level), "unexpected level {}", level);
    assert_eq!(quiet_meter.level(), 0);

    let mut mixed = 0;
    while let Ok(frame) = audio.try_recv() {
        if let MediaFrame::Audio(chunk) = frame {
            assert!(!chunk.is_empty());
            mixed += 1;
        }
    }
    assert!(mixed > 0);
    assert!(compositor.stats().audio_chunks_emitted > 0);
}

#[tokio::test]
async fn denied_capture_is_not_retried() {
    init_tracing();
    let backend = SyntheticCapture::new(SMALL, 10);
    backend.deny(SourceKind::Screen);

    let result = backend.open(SourceKind::Screen).await;
    assert!(matches!(result, Err(livecast::Error::DeviceAccessDenied(_))));

    backend.allow(SourceKind::Screen);
    tokio_test::assert_ok!(backend.open(SourceKind::Screen).await);
}
