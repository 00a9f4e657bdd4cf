//! Prometheus metrics for the acceptor.

use std::sync::Arc;

use measured::label::{LabelGroupVisitor, LabelName, LabelValue, LabelVisitor};
use measured::metric::MetricEncoding;
use measured::metric::gauge::GaugeState;
use measured::metric::group::Encoding;
use measured::metric::name::MetricName;
use measured::text::BufferedTextEncoder;
use measured::{Counter, MetricGroup};
use tokio::sync::Mutex;

use crate::store::SlotStore;

#[derive(MetricGroup)]
#[metric(new(store: SlotStore))]
pub struct AcceptorMetrics {
    pub prepares_total: Counter,
    pub promises_total: Counter,
    pub accepts_total: Counter,
    pub accepted_total: Counter,
    pub nacks_total: Counter,
    pub notify_failures_total: Counter,

    #[metric(namespace = "storage")]
    #[metric(init = StorageCollector::new(store))]
    storage: StorageCollector,
}

pub struct StorageCollector {
    store: SlotStore,
}

impl StorageCollector {
    #[must_use]
    pub fn new(store: SlotStore) -> Self {
        Self { store }
    }
}

#[derive(Copy, Clone)]
enum KeyspaceKind {
    Slots,
    Elections,
    Meta,
}

impl KeyspaceKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Slots => "slots",
            Self::Elections => "elections",
            Self::Meta => "meta",
        }
    }
}

impl LabelValue for KeyspaceKind {
    fn visit<V: LabelVisitor>(&self, v: V) -> V::Output {
        v.write_str(self.as_str())
    }
}

impl measured::label::LabelGroup for KeyspaceKind {
    fn visit_values(&self, v: &mut impl LabelGroupVisitor) {
        const NAME: &LabelName = LabelName::from_str("keyspace");
        v.write_value(NAME, self);
    }
}

impl<Enc: Encoding> MetricGroup<Enc> for StorageCollector
where
    GaugeState: MetricEncoding<Enc>,
{
    fn collect_group_into(&self, enc: &mut Enc) -> Result<(), Enc::Err> {
        const NAME: &MetricName = MetricName::from_str("disk_bytes");

        enc.write_help(NAME, "disk space used by acceptor keyspaces")?;

        let sizes = self.store.storage_sizes();
        let rows = [
            (KeyspaceKind::Slots, sizes.slots_bytes),
            (KeyspaceKind::Elections, sizes.elections_bytes),
            (KeyspaceKind::Meta, sizes.meta_bytes),
        ];
        for (kind, bytes) in rows {
            #[allow(clippy::cast_possible_wrap)]
            measured::metric::gauge::write_gauge(enc, NAME, kind, bytes as i64)?;
        }

        Ok(())
    }
}

pub struct MetricsEncoder {
    encoder: Mutex<BufferedTextEncoder>,
    pub metrics: AcceptorMetrics,
}

impl MetricsEncoder {
    #[must_use]
    pub fn new(metrics: AcceptorMetrics) -> Self {
        Self {
            encoder: Mutex::default(),
            metrics,
        }
    }

    /// # Panics
    ///
    /// Panics if metric collection fails.
    pub async fn encode(&self) -> Vec<u8> {
        let mut encoder = self.encoder.lock().await;
        self.metrics.collect_group_into(&mut *encoder).unwrap();
        encoder.finish().to_vec()
    }
}

pub type SharedMetrics = Arc<MetricsEncoder>;
