// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Video renderers.
//!
//! A [`Renderer`] is the video sink the bridge attaches to engine tracks. It
//! does not draw anything; it watches frame geometry and reports the first
//! frame, size changes and rotation changes on its own event stream. Frames
//! arrive on engine threads, so the observed geometry sits behind a mutex.

use std::sync::{Arc, Mutex, PoisonError};

use rtcbridge_core::engine::{VideoFrame, VideoSink};
use rtcbridge_core::{EventSink, Handle, RendererEvent, ResourceKind, Result};

use crate::entities::{RendererBinding, RendererEntry};
use crate::registry::RegistryInner;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct FrameGeometry {
    first_frame_seen: bool,
    width: u32,
    height: u32,
    rotation: i32,
}

#[derive(Debug)]
pub struct Renderer {
    id: i64,
    sink: EventSink,
    geometry: Mutex<FrameGeometry>,
}

impl Renderer {
    pub fn new(id: i64, sink: EventSink) -> Self {
        Self { id, sink, geometry: Mutex::new(FrameGeometry::default()) }
    }

    pub const fn id(&self) -> i64 {
        self.id
    }

    pub const fn events(&self) -> &EventSink {
        &self.sink
    }

    /// Forgets the last geometry so the next source reports afresh.
    pub fn reset(&self) {
        *self.geometry.lock().unwrap_or_else(PoisonError::into_inner) = FrameGeometry::default();
    }
}

impl VideoSink for Renderer {
    fn on_frame(&self, frame: VideoFrame) {
        let mut events = Vec::with_capacity(3);
        {
            let mut geometry = self.geometry.lock().unwrap_or_else(PoisonError::into_inner);
            if !geometry.first_frame_seen {
                geometry.first_frame_seen = true;
                events.push(RendererEvent::FirstFrameRendered { id: self.id });
            }
            if geometry.rotation != frame.rotation {
                geometry.rotation = frame.rotation;
                events.push(RendererEvent::RotationChanged {
                    id: self.id,
                    rotation: frame.rotation,
                });
            }
            if geometry.width != frame.width || geometry.height != frame.height {
                geometry.width = frame.width;
                geometry.height = frame.height;
                events.push(RendererEvent::VideoSizeChanged {
                    id: self.id,
                    width: frame.width,
                    height: frame.height,
                });
            }
        }
        for event in events {
            self.sink.publish(event);
        }
    }
}

/// Binds `renderer_id` to `target`, or unbinds it when `target` is `None`.
///
/// Runs under the registry lock so concurrent rebinds of one renderer are
/// serialized. Rebinding to the track already shown is a no-op; otherwise the
/// previous track loses the sink exactly once before the new one gains it.
pub fn bind(
    inner: &mut RegistryInner,
    renderer_id: i64,
    target: Option<RendererBinding>,
) -> Result<()> {
    let entry = inner.renderers.get_mut(&renderer_id)?;
    let sink = entry.sink();

    let same_track = matches!(
        (&entry.binding, &target),
        (Some(current), Some(next))
            if rtcbridge_core::engine::same_object(&current.track, &next.track)
    );
    if same_track {
        // Only the bookkeeping (e.g. owner tag) may change.
        entry.binding = target;
        return Ok(());
    }

    if let Some(previous) = entry.binding.take() {
        tracing::debug!(renderer = renderer_id, track = %previous.track_id, "detaching renderer");
        previous.track.remove_sink(&sink);
    }
    entry.renderer.reset();
    if let Some(next) = target {
        tracing::debug!(renderer = renderer_id, track = %next.track_id, "attaching renderer");
        next.track.add_sink(sink);
        entry.binding = Some(next);
    }
    Ok(())
}

/// Clears every renderer binding that matches `matches`, returning the
/// detach work to run once the lock is released.
pub fn unbind_where(
    inner: &mut RegistryInner,
    mut matches: impl FnMut(&RendererBinding) -> bool,
) -> Vec<PendingDetach> {
    let mut pending = Vec::new();
    for entry in inner.renderers.values_mut() {
        if entry.binding.as_ref().is_some_and(&mut matches) {
            if let Some(binding) = entry.binding.take() {
                pending.push(PendingDetach { renderer: entry.clone(), binding });
            }
        }
    }
    pending
}

/// Unbinds renderers showing the track `track_id`.
pub fn unbind_track(inner: &mut RegistryInner, track_id: &Handle) -> Vec<PendingDetach> {
    unbind_where(inner, |binding| &binding.track_id == track_id)
}

/// A renderer detach deferred until after the registry lock is dropped.
#[derive(Debug)]
pub struct PendingDetach {
    renderer: RendererEntry,
    binding: RendererBinding,
}

impl PendingDetach {
    pub fn run(self) {
        tracing::debug!(
            renderer = self.renderer.id,
            track = %self.binding.track_id,
            "detaching renderer from released track"
        );
        self.binding.track.remove_sink(&self.renderer.sink());
        self.renderer.renderer.reset();
    }
}

/// Removes a renderer, detaching it from its track. Returns `Ok(false)` when
/// the renderer was already disposed.
pub fn dispose(inner: &mut RegistryInner, renderer_id: i64) -> Result<bool> {
    match inner.renderers.remove(&renderer_id) {
        Ok(entry) => {
            if let Some(binding) = &entry.binding {
                binding.track.remove_sink(&entry.sink());
            }
            entry.renderer.events().close();
            inner.retired.insert(ResourceKind::Renderer, renderer_id);
            Ok(true)
        },
        Err(_) if inner.retired.contains(ResourceKind::Renderer, &renderer_id.to_string()) => {
            Ok(false)
        },
        Err(err) => Err(err),
    }
}

/// Creates a renderer with its own event stream and registers it.
pub fn create(inner: &mut RegistryInner) -> Arc<Renderer> {
    let id = inner.allocate_texture_id();
    let sink = EventSink::spawn(rtcbridge_core::EventStream::Renderer(id).name());
    let renderer = Arc::new(Renderer::new(id, sink));
    inner.renderers.put(id, RendererEntry { id, renderer: renderer.clone(), binding: None });
    renderer
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn reports_first_frame_then_only_changes() {
        let sink = EventSink::spawn("videoRendererEvent/1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.attach(tx);
        let renderer = Renderer::new(1, sink.clone());

        renderer.on_frame(VideoFrame { width: 640, height: 480, rotation: 0 });
        renderer.on_frame(VideoFrame { width: 640, height: 480, rotation: 0 });
        renderer.on_frame(VideoFrame { width: 640, height: 480, rotation: 90 });
        renderer.on_frame(VideoFrame { width: 1280, height: 720, rotation: 90 });
        sink.flush().await;

        let names: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.get("event").unwrap().as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "didFirstFrameRendered",
                "didTextureChangeVideoSize",
                "didTextureChangeRotation",
                "didTextureChangeVideoSize",
            ]
        );
    }
}
