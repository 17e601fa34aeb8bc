use anyhow::{anyhow, Result};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

/// A queued call together with the channel its result goes back on
struct RpcRequest<Op, Resp> {
    operation: Op,
    reply: oneshot::Sender<Result<Resp>>,
}

/// Funnels node calls through one dispatcher task that enforces a minimum
/// interval between dispatches and a cap on calls in flight.
pub struct RpcExecutor<Op, Resp>
where
    Op: Send + 'static,
    Resp: Send + 'static,
{
    requests: mpsc::UnboundedSender<RpcRequest<Op, Resp>>,
    _dispatcher: JoinHandle<()>,
}

impl<Op, Resp> RpcExecutor<Op, Resp>
where
    Op: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<F, Fut>(name: &str, max_concurrent: usize, min_interval_ms: u64, call: F) -> Self
    where
        F: Fn(Op) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let (requests, mut inbox) = mpsc::unbounded_channel::<RpcRequest<Op, Resp>>();
        let call = Arc::new(call);
        let in_flight = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let min_interval = Duration::from_millis(min_interval_ms);
        let name = name.to_string();

        info!(
            "{} executor starting: max_concurrent={}, min_interval={}ms",
            name, max_concurrent, min_interval_ms
        );

        let dispatcher = tokio::spawn(async move {
            let mut last_dispatch: Option<Instant> = None;

            while let Some(request) = inbox.recv().await {
                if let Some(last) = last_dispatch {
                    let elapsed = last.elapsed();
                    if elapsed < min_interval {
                        debug!("{} executor pacing for {:?}", name, min_interval - elapsed);
                        time::sleep(min_interval - elapsed).await;
                    }
                }
                last_dispatch = Some(Instant::now());

                // Permit is taken before spawning so the cap holds the queue back
                let permit = match in_flight.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let _ = request.reply.send(Err(anyhow!("{} executor closed", name)));
                        continue;
                    }
                };

                let call = call.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    let result = call(request.operation).await;
                    drop(permit);
                    if request.reply.send(result).is_err() {
                        warn!("{} executor: caller went away before the response", name);
                    }
                });
            }

            info!("{} executor stopped", name);
        });

        Self {
            requests,
            _dispatcher: dispatcher,
        }
    }

    /// Queue an operation and wait for its result
    pub async fn execute(&self, operation: Op) -> Result<Resp> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(RpcRequest { operation, reply })
            .map_err(|_| anyhow!("executor dispatcher has stopped"))?;

        response
            .await
            .map_err(|_| anyhow!("executor dropped the request"))?
    }
}
