//! RTSP frame source backed by GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! videoscale ! RGB appsink`,
//! scaled to the session's configured resolution. The pipeline is rebuilt
//! for every connection attempt and torn down when the source is dropped.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use url::Url;

use crate::error::DriverError;
use crate::frame::Frame;
use crate::settings::StreamSettings;

use super::FrameSource;

pub struct RtspSource {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_error: Option<String>,
}

impl RtspSource {
    pub fn new(uri: &Url, settings: &StreamSettings) -> Result<Self, DriverError> {
        build_pipeline(uri, settings).map_err(|e| DriverError::Config(format!("{:#}", e)))
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

fn build_pipeline(uri: &Url, settings: &StreamSettings) -> Result<RtspSource> {
    gstreamer::init().context("initialize gstreamer")?;

    let description = format!(
        "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! videoscale ! \
         video/x-raw,format=RGB,width={},height={} ! \
         appsink name=appsink sync=false max-buffers=1 drop=true",
        uri, settings.width, settings.height
    );
    let pipeline = gstreamer::parse::launch(&description)
        .context("build RTSP pipeline")?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

    let appsink = pipeline
        .by_name("appsink")
        .context("appsink element missing from pipeline")?
        .downcast::<gstreamer_app::AppSink>()
        .map_err(|_| anyhow!("appsink element has unexpected type"))?;

    Ok(RtspSource {
        url: uri.to_string(),
        pipeline,
        appsink,
        frame_count: 0,
        last_error: None,
    })
}

impl FrameSource for RtspSource {
    fn connect(&mut self, timeout: Duration) -> Result<(), DriverError> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| DriverError::Dial(format!("{}: {}", self.url, e)))?;
        let (result, _, _) = self
            .pipeline
            .state(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64));
        match result {
            Ok(gstreamer::StateChangeSuccess::Success)
            | Ok(gstreamer::StateChangeSuccess::NoPreroll) => {}
            Ok(_) => {
                return Err(DriverError::Timeout(format!(
                    "{} did not start within {} ms",
                    self.url,
                    timeout.as_millis()
                )))
            }
            Err(_) => {
                self.poll_bus();
                let reason = self
                    .last_error
                    .take()
                    .unwrap_or_else(|| "pipeline refused to play".to_string());
                return Err(DriverError::Dial(format!("{}: {}", self.url, reason)));
            }
        }
        log::info!("RtspSource: connected to {}", self.url);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, DriverError> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            return Err(DriverError::StreamClosed(err));
        }

        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| {
                if self.appsink.is_eos() {
                    DriverError::StreamClosed(format!("{} reached end of stream", self.url))
                } else {
                    DriverError::Timeout(format!("no frame within {} ms", timeout.as_millis()))
                }
            })?;

        let (pixels, width, height) =
            sample_to_pixels(&sample).map_err(|e| DriverError::Decode(format!("{:#}", e)))?;
        self.frame_count += 1;
        Frame::new(pixels, width, height).map_err(|e| DriverError::Decode(e.to_string()))
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline for {}: {}", self.url, err);
        }
        log::debug!(
            "RtspSource: closed {} after {} frames",
            self.url,
            self.frame_count
        );
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
