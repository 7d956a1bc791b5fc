pub mod server;
pub mod transport;

use std::sync::Arc;

use tokio::sync::Semaphore;

use midterm_core::HostCore;

/// Binds the platform IPC endpoint and accepts connections forever,
/// spawning one task per connection. Each connection is independent;
/// `workers` is shared across all of them so the worker-pool limit
/// applies host-wide, not per-connection.
pub async fn serve(host: Arc<HostCore>, endpoint: &str, worker_count: usize) -> Result<(), midterm_core::CoreError> {
    let workers = Arc::new(Semaphore::new(worker_count.max(1)));

    #[cfg(unix)]
    {
        let listener = transport::unix::bind(endpoint)?;
        log::info!("ipc: listening on unix socket {endpoint}");
        loop {
            let stream = transport::unix::accept(&listener).await?;
            let host = host.clone();
            let workers = workers.clone();
            tokio::spawn(async move {
                server::handle_connection(stream, host, workers).await;
            });
        }
    }

    #[cfg(windows)]
    {
        let mut pipe = transport::windows::bind(endpoint)?;
        log::info!("ipc: listening on named pipe {endpoint}");
        loop {
            let (connected, next) = transport::windows::accept(pipe, endpoint).await?;
            pipe = next;
            let host = host.clone();
            let workers = workers.clone();
            tokio::spawn(async move {
                server::handle_connection(connected, host, workers).await;
            });
        }
    }
}
