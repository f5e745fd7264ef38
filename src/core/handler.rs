// Capability traits invoked by the transport for inbound samples and queries.
use crate::core::fifo::FifoSender;
use crate::core::query::Query;
use crate::core::sample::Sample;

/// Called once per incoming query matching a queryable's key expression.
///
/// Runs on a transport worker thread. Invocations for different queries may
/// overlap; implementations guard their own shared state.
pub trait QueryHandler: Send + Sync + 'static {
    fn on_query(&self, query: Query);
}

impl<F> QueryHandler for F
where
    F: Fn(Query) + Send + Sync + 'static,
{
    fn on_query(&self, query: Query) {
        self(query)
    }
}

/// Called once per sample matching a subscriber's key expression.
pub trait SampleHandler: Send + Sync + 'static {
    fn on_sample(&self, sample: Sample);
}

impl<F> SampleHandler for F
where
    F: Fn(Sample) + Send + Sync + 'static,
{
    fn on_sample(&self, sample: Sample) {
        self(sample)
    }
}

impl SampleHandler for FifoSender<Sample> {
    fn on_sample(&self, sample: Sample) {
        if let Err(err) = self.send(sample) {
            tracing::debug!(kind = err.kind().as_str(), "sample not queued: {err}");
        }
    }
}
