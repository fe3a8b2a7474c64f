use crate::device::{DeviceMode, DeviceRecord};
use futures_util::Stream;
use futures_util::stream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle on a running observation of the device record.
///
/// Yields the normalized record after every push. Dropping the handle stops
/// the observation; no push is processed after that.
pub struct Subscription<M: DeviceMode> {
    records: watch::Receiver<Option<DeviceRecord<M>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<M: DeviceMode> Subscription<M> {
    pub(crate) fn new(
        records: watch::Receiver<Option<DeviceRecord<M>>>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            records,
            cancel,
            task,
        }
    }

    /// Wait for the next record. Returns `None` once cancelled.
    pub async fn next(&mut self) -> Option<DeviceRecord<M>> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                changed = self.records.changed() => {
                    changed.ok()?;
                    if let Some(record) = self.records.borrow_and_update().clone() {
                        return Some(record);
                    }
                }
            }
        }
    }

    /// Latest record received, if any.
    pub fn current(&self) -> Option<DeviceRecord<M>> {
        self.records.borrow().clone()
    }

    /// Stop observing. In-flight writes are not affected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Turn the subscription into a stream of records.
    pub fn into_stream(self) -> impl Stream<Item = DeviceRecord<M>> {
        stream::unfold(self, |mut subscription| async move {
            let record = subscription.next().await?;
            Some((record, subscription))
        })
    }
}

impl<M: DeviceMode> Drop for Subscription<M> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
