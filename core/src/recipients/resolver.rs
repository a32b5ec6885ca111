//! Debounced recipient resolution for the broadcast compose dialog.

use std::sync::{Arc, Weak};

use chat_api::{BroadcastFilter, FilterOptions};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::error::{Result, ValidationError};
use crate::transport::ConversationTransport;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecipientCount {
    #[default]
    Unknown,
    Known(u32),
}

/// Observable state of the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolverStatus {
    pub count: RecipientCount,
    /// A debounced request is waiting to fire.
    pub pending: bool,
    /// Resolve calls issued and not yet answered.
    pub in_flight: usize,
}

impl ResolverStatus {
    pub fn is_resolving(&self) -> bool {
        self.pending || self.in_flight > 0
    }

    pub fn can_commit(&self) -> bool {
        !self.is_resolving() && matches!(self.count, RecipientCount::Known(n) if n > 0)
    }
}

/// A filter accepted for sending, with the count it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBroadcast {
    pub filter: BroadcastFilter,
    pub recipient_count: u32,
}

#[derive(Default)]
struct ResolverState {
    /// Generation of the armed debounce timer.
    debounce_gen: u64,
    debounce: Option<JoinHandle<()>>,
    issued: u64,
    applied: u64,
    in_flight: usize,
    count: RecipientCount,
    resolved_for: Option<BroadcastFilter>,
    /// Bumped by `close`; answers from an earlier cycle are ignored.
    cycle: u64,
}

impl ResolverState {
    fn status(&self) -> ResolverStatus {
        ResolverStatus {
            count: self.count,
            pending: self.debounce.is_some(),
            in_flight: self.in_flight,
        }
    }
}

struct Inner {
    transport: Arc<dyn ConversationTransport>,
    debounce: Duration,
    state: Mutex<ResolverState>,
    status: watch::Sender<ResolverStatus>,
}

/// Turns a stream of filter edits into at most one resolve call per quiet
/// period, and keeps only the answer to the newest call.
#[derive(Clone)]
pub struct RecipientResolver {
    inner: Arc<Inner>,
}

impl RecipientResolver {
    pub fn new(transport: Arc<dyn ConversationTransport>) -> Self {
        Self::with_debounce(transport, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(transport: Arc<dyn ConversationTransport>, debounce: Duration) -> Self {
        let (status, _) = watch::channel(ResolverStatus::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                debounce,
                state: Mutex::new(ResolverState::default()),
                status,
            }),
        }
    }

    pub async fn load_options(&self) -> Result<FilterOptions> {
        self.inner.transport.filter_options().await
    }

    /// Note a filter change. Restarts the quiet period; the resolve call for
    /// `filter` is issued only if no further change arrives before it ends.
    pub fn request(&self, filter: BroadcastFilter) {
        let mut st = self.inner.state.lock();
        if let Some(timer) = st.debounce.take() {
            timer.abort();
        }
        st.debounce_gen += 1;
        let gen = st.debounce_gen;
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.debounce;
        st.debounce = Some(tokio::spawn(async move {
            sleep(delay).await;
            fire(weak, gen, filter);
        }));
        self.inner.publish(&st);
    }

    pub fn status(&self) -> ResolverStatus {
        self.inner.state.lock().status()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResolverStatus> {
        self.inner.status.subscribe()
    }

    pub fn can_commit(&self) -> bool {
        self.status().can_commit()
    }

    /// Accept `filter` for sending. Fails while a resolution is pending or in
    /// flight, when the last answer was for a different filter, or when it
    /// matched nobody.
    pub fn commit(&self, filter: &BroadcastFilter) -> Result<CommittedBroadcast> {
        let st = self.inner.state.lock();
        if st.debounce.is_some() || st.in_flight > 0 {
            return Err(ValidationError::Resolving.into());
        }
        match (st.count, st.resolved_for.as_ref()) {
            (RecipientCount::Known(n), Some(resolved)) if n > 0 && resolved == filter => {
                Ok(CommittedBroadcast {
                    filter: resolved.clone(),
                    recipient_count: n,
                })
            }
            _ => Err(ValidationError::NoRecipients.into()),
        }
    }

    /// End the current dialog. The pending timer is cancelled, answers still
    /// in flight are ignored and the count returns to `Unknown`. A later
    /// `request` starts over.
    pub fn close(&self) {
        let mut st = self.inner.state.lock();
        if let Some(timer) = st.debounce.take() {
            timer.abort();
        }
        st.debounce_gen += 1;
        st.cycle += 1;
        st.applied = st.issued;
        st.in_flight = 0;
        st.count = RecipientCount::Unknown;
        st.resolved_for = None;
        self.inner.publish(&st);
    }
}

impl Inner {
    fn publish(&self, st: &ResolverState) {
        self.status.send_replace(st.status());
    }

    fn apply(&self, cycle: u64, seq: u64, filter: BroadcastFilter, result: Result<u32>) {
        let mut st = self.state.lock();
        if cycle != st.cycle {
            debug!(seq, "discarding recipient count from a closed dialog");
            return;
        }
        st.in_flight = st.in_flight.saturating_sub(1);
        if seq <= st.applied {
            debug!(seq, applied = st.applied, "discarding superseded recipient count");
            self.publish(&st);
            return;
        }
        st.applied = seq;
        match result {
            Ok(n) => {
                debug!(seq, count = n, "recipients resolved");
                st.count = RecipientCount::Known(n);
                st.resolved_for = Some(filter);
            }
            Err(e) => {
                warn!(seq, error = %e, "recipient resolution failed");
                st.count = RecipientCount::Unknown;
                st.resolved_for = None;
            }
        }
        self.publish(&st);
    }
}

fn fire(weak: Weak<Inner>, gen: u64, filter: BroadcastFilter) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let (cycle, seq) = {
        let mut st = inner.state.lock();
        if st.debounce_gen != gen {
            return;
        }
        st.debounce = None;
        st.issued += 1;
        let seq = st.issued;
        if filter.recipient_class.is_none() {
            st.applied = seq;
            st.count = RecipientCount::Unknown;
            st.resolved_for = None;
            inner.publish(&st);
            return;
        }
        st.in_flight += 1;
        inner.publish(&st);
        (st.cycle, seq)
    };
    tokio::spawn(async move {
        let result = inner.transport.resolve_recipients(&filter).await;
        inner.apply(cycle, seq, filter, result);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::recipients::FilterEditor;
    use crate::transport::mock::{MockCall, MockOp, MockTransport};
    use chat_api::{CityOption, FilterOption, RecipientClass};

    fn options() -> FilterOptions {
        let opt = |id: &str| FilterOption {
            id: id.into(),
            name: id.into(),
        };
        FilterOptions {
            regions: vec![opt("north"), opt("south")],
            cities: vec![
                CityOption {
                    id: "n1".into(),
                    name: "n1".into(),
                    region_id: "north".into(),
                },
                CityOption {
                    id: "s1".into(),
                    name: "s1".into(),
                    region_id: "south".into(),
                },
            ],
            ..Default::default()
        }
    }

    fn student_filter(regions: &[&str]) -> BroadcastFilter {
        let mut f = BroadcastFilter::for_class(RecipientClass::Student);
        f.regions = regions.iter().map(|r| r.to_string()).collect();
        f
    }

    fn setup() -> (Arc<MockTransport>, RecipientResolver) {
        let mock = MockTransport::default().shared();
        mock.resolve_with(|f| 10 + f.regions.len() as u32 + f.cities.len() as u32);
        let resolver = RecipientResolver::new(mock.clone());
        (mock, resolver)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_edits_issues_one_call_after_quiet_period() {
        let (mock, resolver) = setup();
        let mut editor = FilterEditor::new(options());
        editor.set_recipient_class(Some(RecipientClass::Student));
        resolver.request(editor.filter().clone());
        for step in 0..4 {
            sleep(Duration::from_millis(100)).await;
            match step {
                0 => editor.toggle_region("north"),
                1 => editor.toggle_region("south"),
                2 => editor.toggle_city("s1"),
                _ => editor.toggle_region("south"),
            };
            resolver.request(editor.filter().clone());
        }
        sleep(Duration::from_millis(499)).await;
        assert_eq!(mock.count(MockOp::Resolve), 0);
        assert!(resolver.status().pending);

        sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(mock.count(MockOp::Resolve), 1);
        assert_eq!(
            mock.calls().last(),
            Some(&MockCall::Resolve(student_filter(&["north"])))
        );
        assert_eq!(resolver.status().count, RecipientCount::Known(11));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_class_is_unknown_without_a_call() {
        let (mock, resolver) = setup();
        resolver.request(BroadcastFilter::default());
        sleep(Duration::from_millis(600)).await;
        assert_eq!(mock.count(MockOp::Resolve), 0);
        let status = resolver.status();
        assert_eq!(status.count, RecipientCount::Unknown);
        assert!(!status.is_resolving());
    }

    #[tokio::test(start_paused = true)]
    async fn late_answer_to_older_request_is_discarded() {
        let (mock, resolver) = setup();
        mock.push_resolve_delay(Duration::from_secs(2));
        mock.push_resolve_delay(Duration::from_millis(10));

        resolver.request(student_filter(&["north"]));
        sleep(Duration::from_millis(600)).await;
        assert_eq!(resolver.status().in_flight, 1);

        resolver.request(student_filter(&["north", "south"]));
        sleep(Duration::from_millis(600)).await;
        assert_eq!(resolver.status().count, RecipientCount::Known(12));

        sleep(Duration::from_secs(2)).await;
        let status = resolver.status();
        assert_eq!(status.count, RecipientCount::Known(12));
        assert_eq!(status.in_flight, 0);
        assert_eq!(mock.count(MockOp::Resolve), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_is_gated_on_settled_positive_count() {
        let (mock, resolver) = setup();
        let filter = student_filter(&["north"]);
        mock.set_delay(MockOp::Resolve, Duration::from_millis(100));

        resolver.request(filter.clone());
        assert!(matches!(
            resolver.commit(&filter),
            Err(ChatError::Validation(ValidationError::Resolving))
        ));
        sleep(Duration::from_millis(550)).await;
        assert!(resolver.status().in_flight > 0);
        assert!(matches!(
            resolver.commit(&filter),
            Err(ChatError::Validation(ValidationError::Resolving))
        ));
        sleep(Duration::from_millis(100)).await;
        assert!(resolver.can_commit());

        let committed = resolver.commit(&filter).unwrap();
        assert_eq!(committed.recipient_count, 11);
        assert_eq!(committed.filter, filter);

        let other = student_filter(&["south"]);
        assert!(matches!(
            resolver.commit(&other),
            Err(ChatError::Validation(ValidationError::NoRecipients))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_count_cannot_commit() {
        let (mock, resolver) = setup();
        mock.resolve_with(|_| 0);
        let filter = student_filter(&[]);
        resolver.request(filter.clone());
        sleep(Duration::from_millis(600)).await;
        assert_eq!(resolver.status().count, RecipientCount::Known(0));
        assert!(!resolver.can_commit());
        assert!(resolver.commit(&filter).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_resets_count_to_unknown() {
        let (mock, resolver) = setup();
        resolver.request(student_filter(&[]));
        sleep(Duration::from_millis(600)).await;
        assert_eq!(resolver.status().count, RecipientCount::Known(10));

        mock.fail_next(MockOp::Resolve);
        resolver.request(student_filter(&["north"]));
        sleep(Duration::from_millis(600)).await;
        assert_eq!(resolver.status().count, RecipientCount::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_timer_and_ignores_in_flight() {
        let (mock, resolver) = setup();
        mock.set_delay(MockOp::Resolve, Duration::from_millis(300));
        resolver.request(student_filter(&[]));
        sleep(Duration::from_millis(600)).await;
        assert_eq!(resolver.status().in_flight, 1);
        resolver.close();
        assert!(!resolver.status().is_resolving());

        resolver.request(student_filter(&["south"]));
        resolver.close();
        sleep(Duration::from_secs(1)).await;
        let status = resolver.status();
        assert_eq!(status.count, RecipientCount::Unknown);
        assert!(!status.is_resolving());
        assert_eq!(mock.count(MockOp::Resolve), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reopened_dialog_resolves_again() {
        let (mock, resolver) = setup();
        let first = student_filter(&[]);
        resolver.request(first.clone());
        sleep(Duration::from_millis(600)).await;
        assert!(resolver.commit(&first).is_ok());
        resolver.close();
        assert!(matches!(
            resolver.commit(&first),
            Err(ChatError::Validation(ValidationError::NoRecipients))
        ));

        let second = student_filter(&["north"]);
        resolver.request(second.clone());
        sleep(Duration::from_millis(600)).await;
        assert_eq!(mock.count(MockOp::Resolve), 2);
        assert_eq!(resolver.status().count, RecipientCount::Known(11));
        let committed = resolver.commit(&second).unwrap();
        assert_eq!(committed.recipient_count, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_from_closed_dialog_does_not_leak_into_next() {
        let (mock, resolver) = setup();
        mock.push_resolve_delay(Duration::from_secs(2));
        resolver.request(student_filter(&[]));
        sleep(Duration::from_millis(600)).await;
        resolver.close();

        resolver.request(student_filter(&["north", "south"]));
        sleep(Duration::from_millis(600)).await;
        assert_eq!(resolver.status().count, RecipientCount::Known(12));
        sleep(Duration::from_secs(2)).await;
        let status = resolver.status();
        assert_eq!(status.count, RecipientCount::Known(12));
        assert_eq!(status.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_see_status_changes() {
        let (_mock, resolver) = setup();
        let mut rx = resolver.subscribe();
        resolver.request(student_filter(&[]));
        rx.changed().await.unwrap();
        assert!(rx.borrow().pending);
        sleep(Duration::from_millis(600)).await;
        assert_eq!(rx.borrow_and_update().count, RecipientCount::Known(10));
    }
}
