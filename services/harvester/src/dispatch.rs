//! One decoder task per announced flow.
//!
//! Flow tasks are independent; they only meet at the conversation store's
//! lock.  Joining the dispatcher therefore means every conversation from
//! every flow has been committed.

use std::sync::Arc;

use capnet_core::NewFlow;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::info;

use crate::conversation::ConversationStore;
use crate::decoder::run_flow;
use crate::stream::FlowReader;

/// Spawn a decoder task for every flow the assembler announces and wait for
/// all of them.  Returns the number of flows seen.
pub async fn run(mut flows: mpsc::Receiver<NewFlow>, store: Arc<ConversationStore>) -> usize {
    let mut tasks = JoinSet::new();
    let mut count = 0usize;
    while let Some(flow) = flows.recv().await {
        count += 1;
        tasks.spawn(run_flow(
            FlowReader::new(flow.segments),
            flow.key,
            Arc::clone(&store),
        ));
    }
    while tasks.join_next().await.is_some() {}
    info!(flows = count, "all flow tasks joined");
    count
}
