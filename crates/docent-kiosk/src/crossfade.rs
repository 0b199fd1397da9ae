//! Two-buffer crossfade surface.
//!
//! A pair of overlapped render buffers whose opacities are animated
//! inversely. The surface itself is a pure state machine advanced by frame
//! ticks; the scheduler drives it at display rate, tests drive it by hand.

use std::sync::Arc;

/// Opaque handle to a fetched image. The renderer only needs identity and
/// bytes; decoding is the host's concern.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    pub id: String,
    pub data: Arc<Vec<u8>>,
}

impl ImageHandle {
    pub fn new(id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            data: Arc::new(data),
        }
    }
}

#[derive(Debug, Default)]
struct Buffer {
    handle: Option<ImageHandle>,
    opacity: f32,
}

#[derive(Debug)]
struct Fade {
    started_ms: i64,
    duration_ms: u64,
}

/// The two-buffer swap. Exactly one buffer is the front (visible) buffer
/// outside of an active fade; `begin` stages the incoming image on the back
/// buffer and `tick` interpolates opacities until the roles swap.
#[derive(Debug)]
pub struct CrossfadeSurface {
    buffers: [Buffer; 2],
    front: usize,
    fade: Option<Fade>,
}

impl CrossfadeSurface {
    pub fn new() -> Self {
        let mut buffers: [Buffer; 2] = Default::default();
        buffers[0].opacity = 1.0;
        Self {
            buffers,
            front: 0,
            fade: None,
        }
    }

    /// Stage `handle` on the idle buffer and start fading it in. A fade that
    /// is still running is completed first so the one-visible-image
    /// invariant holds at every fade boundary.
    pub fn begin(&mut self, handle: ImageHandle, duration_ms: u64, now_ms: i64) {
        if self.fade.is_some() {
            self.finish_fade();
        }

        let back = 1 - self.front;
        self.buffers[back].handle = Some(handle);
        self.buffers[back].opacity = 0.0;

        if duration_ms == 0 {
            self.fade = Some(Fade {
                started_ms: now_ms,
                duration_ms: 0,
            });
            self.finish_fade();
            return;
        }

        self.fade = Some(Fade {
            started_ms: now_ms,
            duration_ms,
        });
    }

    /// Advance the fade to `now_ms`. Returns true while a fade is active.
    pub fn tick(&mut self, now_ms: i64) -> bool {
        let Some(fade) = &self.fade else {
            return false;
        };

        let elapsed = (now_ms - fade.started_ms).max(0) as u64;
        if elapsed >= fade.duration_ms {
            self.finish_fade();
            return false;
        }

        let progress = elapsed as f32 / fade.duration_ms as f32;
        let back = 1 - self.front;
        self.buffers[self.front].opacity = 1.0 - progress;
        self.buffers[back].opacity = progress;
        true
    }

    pub fn is_fading(&self) -> bool {
        self.fade.is_some()
    }

    /// Identity of the image the viewer sees, once any fade completes.
    pub fn visible_id(&self) -> Option<&str> {
        self.buffers[self.front]
            .handle
            .as_ref()
            .map(|h| h.id.as_str())
    }

    pub fn opacities(&self) -> (f32, f32) {
        (self.buffers[self.front].opacity, self.buffers[1 - self.front].opacity)
    }

    fn finish_fade(&mut self) {
        let back = 1 - self.front;
        self.buffers[self.front].opacity = 0.0;
        self.buffers[back].opacity = 1.0;
        self.front = back;
        self.fade = None;
    }
}

impl Default for CrossfadeSurface {
    fn default() -> Self {
        Self::new()
    }
}
