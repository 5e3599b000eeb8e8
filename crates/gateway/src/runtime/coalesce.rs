//! Delta coalescing — batches streamed text into ≥150 ms-spaced events.
//!
//! When a delta arrives and the debounce window has elapsed (or the flush
//! is forced at end of turn), the accumulated buffer is emitted as one
//! event. Otherwise the text is buffered and a timer at
//! `last_emit + interval` is scheduled (if none is pending) to force the
//! flush.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub const DELTA_DEBOUNCE: Duration = Duration::from_millis(150);

type Sink = Box<dyn Fn(String) + Send + Sync>;

pub struct DeltaCoalescer {
    inner: Arc<Inner>,
}

struct Inner {
    interval: Duration,
    sink: Sink,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    buffer: String,
    last_emit: Option<Instant>,
    timer_pending: bool,
}

impl DeltaCoalescer {
    pub fn new(sink: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self::with_interval(DELTA_DEBOUNCE, sink)
    }

    pub fn with_interval(interval: Duration, sink: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval,
                sink: Box::new(sink),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Append a delta; emits immediately when the window has elapsed,
    /// otherwise schedules the pending-timer flush.
    pub fn push(&self, text: &str) {
        let mut state = self.inner.state.lock();
        state.buffer.push_str(text);

        let now = Instant::now();
        let window_open = state
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.inner.interval);

        if window_open {
            Inner::emit(&self.inner, &mut state, now);
        } else if !state.timer_pending {
            state.timer_pending = true;
            let inner = self.inner.clone();
            let deadline = state.last_emit.expect("window closed implies a last emit")
                + self.inner.interval;
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let mut state = inner.state.lock();
                state.timer_pending = false;
                if !state.buffer.is_empty() {
                    Inner::emit(&inner, &mut state, Instant::now());
                }
            });
        }
    }

    /// Force-flush whatever is buffered (end-of-turn).
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        if !state.buffer.is_empty() {
            Inner::emit(&self.inner, &mut state, Instant::now());
        }
    }
}

impl Inner {
    fn emit(inner: &Arc<Inner>, state: &mut State, now: Instant) {
        let text = std::mem::take(&mut state.buffer);
        state.last_emit = Some(now);
        if !text.is_empty() {
            (inner.sink)(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl Fn(String) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        (seen, move |text: String| sink_seen.lock().push(text))
    }

    #[tokio::test(start_paused = true)]
    async fn first_delta_emits_immediately() {
        let (seen, sink) = collector();
        let coalescer = DeltaCoalescer::new(sink);
        coalescer.push("hello");
        assert_eq!(*seen.lock(), vec!["hello"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_deltas_batch_into_few_events() {
        let (seen, sink) = collector();
        let coalescer = DeltaCoalescer::new(sink);

        // 50 chunks, ~10 ms apart, over ~500 ms.
        for i in 0..50 {
            coalescer.push(&format!("c{i};"));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        coalescer.flush();
        tokio::task::yield_now().await;

        let events = seen.lock().clone();
        // ceil(500 / 150) + 1 per the debounce bound.
        assert!(events.len() <= 5, "got {} events", events.len());
        // Concatenation is loss-free and ordered.
        let combined: String = events.concat();
        let expected: String = (0..50).map(|i| format!("c{i};")).collect();
        assert_eq!(combined, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_timer_flushes_tail_without_force() {
        let (seen, sink) = collector();
        let coalescer = DeltaCoalescer::new(sink);

        coalescer.push("a");
        tokio::time::advance(Duration::from_millis(10)).await;
        coalescer.push("b"); // inside the window → buffered + timer
        assert_eq!(*seen.lock(), vec!["a"]);

        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_on_empty_buffer_is_silent() {
        let (seen, sink) = collector();
        let coalescer = DeltaCoalescer::new(sink);
        coalescer.flush();
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn emits_are_at_least_interval_apart() {
        let (seen, sink) = collector();
        let times = Arc::new(Mutex::new(Vec::new()));
        let times_sink = times.clone();
        let coalescer = DeltaCoalescer::new(move |text| {
            times_sink.lock().push(Instant::now());
            sink(text);
        });

        for _ in 0..20 {
            coalescer.push("x");
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;

        let times = times.lock().clone();
        assert!(seen.lock().len() >= 2);
        for pair in times.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= DELTA_DEBOUNCE);
        }
    }
}
