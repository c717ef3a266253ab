fn main() {
    println!("Run `cargo test -p relay-e2e` to execute the end-to-end relay tests.");
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use filerelay_http_source::{HttpSource, HttpSourceConfig};
    use filerelay_transfer::{
        CompositeSource, DirectorySink, ErrorKind, FileSource, Notifier, NotifyError, Phase,
        Relay, RetryPolicy, Sink, SourceDescriptor, StaticSinkProvider, StatusUpdate,
        TransferConfig, TransferEngine, TransferRequest,
    };
    use futures_util::future::BoxFuture;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Collects every status text the relay sends.
    #[derive(Default)]
    struct Transcript {
        texts: Mutex<Vec<String>>,
    }

    impl Transcript {
        fn texts(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }
    }

    impl Notifier for Transcript {
        fn notify<'a>(
            &'a self,
            update: &'a StatusUpdate,
        ) -> BoxFuture<'a, Result<(), NotifyError>> {
            Box::pin(async move {
                self.texts.lock().unwrap().push(update.text.clone());
                Ok(())
            })
        }
    }

    /// How the mock server answers a GET for the payload.
    #[derive(Clone, Copy)]
    enum Behavior {
        /// Serves the body, honouring `Range`.
        Normal,
        /// The first GET sends only `cut` bytes and closes; later ones are normal.
        TruncateFirst { cut: usize },
        /// Sends `cut` bytes and then holds the connection open.
        Stall { cut: usize },
        NotFound,
    }

    struct Server {
        base: String,
        gets: Arc<AtomicUsize>,
        ranges: Arc<Mutex<Vec<u64>>>,
    }

    async fn serve(payload: Arc<Vec<u8>>, behavior: Behavior) -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        let gets = Arc::new(AtomicUsize::new(0));
        let ranges = Arc::new(Mutex::new(Vec::new()));

        let (g, r) = (Arc::clone(&gets), Arc::clone(&ranges));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (payload, gets, ranges) = (Arc::clone(&payload), Arc::clone(&g), Arc::clone(&r));
                tokio::spawn(handle(stream, payload, behavior, gets, ranges));
            }
        });

        Server { base, gets, ranges }
    }

    async fn handle(
        mut stream: TcpStream,
        payload: Arc<Vec<u8>>,
        behavior: Behavior,
        gets: Arc<AtomicUsize>,
        ranges: Arc<Mutex<Vec<u64>>>,
    ) {
        let mut buf = vec![0u8; 8192];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        let request = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
        let total = payload.len();

        if matches!(behavior, Behavior::NotFound) {
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            return;
        }

        if request.starts_with("head ") {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(head.as_bytes()).await;
            return;
        }

        let nth = gets.fetch_add(1, Ordering::SeqCst);
        let start = request
            .lines()
            .find_map(|l| l.strip_prefix("range: bytes="))
            .and_then(|r| r.trim().trim_end_matches('-').parse::<usize>().ok())
            .unwrap_or(0);
        ranges.lock().unwrap().push(start as u64);

        let head = if start > 0 {
            format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {start}-{}/{total}\r\nConnection: close\r\n\r\n",
                total - start,
                total - 1
            )
        } else {
            format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nConnection: close\r\n\r\n")
        };
        let _ = stream.write_all(head.as_bytes()).await;

        match behavior {
            Behavior::TruncateFirst { cut } if nth == 0 => {
                let _ = stream.write_all(&payload[..cut]).await;
            }
            Behavior::Stall { cut } => {
                let _ = stream.write_all(&payload[..cut]).await;
                let _ = stream.flush().await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            _ => {
                let _ = stream.write_all(&payload[start..]).await;
            }
        }
        let _ = stream.shutdown().await;
    }

    fn payload(len: usize) -> Arc<Vec<u8>> {
        Arc::new((0..len).map(|i| (i * 31 % 251) as u8).collect())
    }

    fn relay(out: &Path, notifier: Arc<Transcript>) -> Relay {
        let http = HttpSource::new(&HttpSourceConfig::default()).unwrap();
        let files = FileSource::new(None, 64 * 1024);
        let source = CompositeSource::new(Arc::new(http), Arc::new(files));

        let config = TransferConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(20),
            },
            progress_interval: Duration::ZERO,
            ..TransferConfig::default()
        };
        let engine = TransferEngine::new(Arc::new(source), notifier, config);
        let sink: Arc<dyn Sink> = Arc::new(DirectorySink::new(out));
        Relay::new(engine, Arc::new(StaticSinkProvider::new(sink)))
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn url_is_relayed_into_directory() {
        let data = payload(3 * 1024 * 1024 + 123);
        let server = serve(Arc::clone(&data), Behavior::Normal).await;
        let out = TempDir::new().unwrap();
        let transcript = Arc::new(Transcript::default());
        let relay = relay(out.path(), Arc::clone(&transcript));

        let result = relay
            .submit(TransferRequest::new(
                "chat-1",
                SourceDescriptor::Url(format!("{}/media/movie.bin?token=abc", server.base)),
            ))
            .unwrap()
            .await
            .unwrap();

        let file = result.outcome.as_ref().unwrap();
        assert_eq!(file.name, "movie.bin");
        assert_eq!(file.bytes, data.len() as u64);
        assert_eq!(file.sha256, hex::encode(Sha256::digest(data.as_slice())));
        assert_eq!(result.bytes_moved, data.len() as u64);

        let stored = out.path().join("movie.bin");
        assert_eq!(std::fs::read(&stored).unwrap(), *data);
        assert_eq!(files_in(out.path()), vec!["movie.bin".to_string()]);
        assert!(result.summary().starts_with("File uploaded as: movie.bin"));
        assert_eq!(server.gets.load(Ordering::SeqCst), 1);

        assert!(relay.registry().is_empty());
        let texts = transcript.texts();
        assert_eq!(texts.first().map(String::as_str), Some("Fetching file details..."));
        assert!(texts.iter().any(|t| t.contains("100%")));
    }

    #[tokio::test]
    async fn truncated_download_resumes_with_range() {
        let data = payload(2 * 1024 * 1024);
        let cut = 512 * 1024;
        let server = serve(Arc::clone(&data), Behavior::TruncateFirst { cut }).await;
        let out = TempDir::new().unwrap();
        let relay = relay(out.path(), Arc::new(Transcript::default()));

        let result = relay
            .submit(
                TransferRequest::new(
                    "chat-1",
                    SourceDescriptor::Url(format!("{}/backup.tar", server.base)),
                )
                .with_name("nightly.tar"),
            )
            .unwrap()
            .await
            .unwrap();

        let file = result.outcome.as_ref().unwrap();
        assert_eq!(file.name, "nightly.tar");
        assert_eq!(file.sha256, hex::encode(Sha256::digest(data.as_slice())));
        assert_eq!(std::fs::read(out.path().join("nightly.tar")).unwrap(), *data);

        // The second request picks up where the stored bytes end.
        let ranges = server.ranges.lock().unwrap().clone();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], 0);
        assert!(ranges[1] > 0 && ranges[1] <= cut as u64);
    }

    #[tokio::test]
    async fn cancel_stops_stalled_transfer_and_cleans_up() {
        let data = payload(8 * 1024 * 1024);
        let server = serve(Arc::clone(&data), Behavior::Stall { cut: 256 * 1024 }).await;
        let out = TempDir::new().unwrap();
        let transcript = Arc::new(Transcript::default());
        let relay = relay(out.path(), Arc::clone(&transcript));

        let handle = relay
            .submit(TransferRequest::new(
                "chat-1",
                SourceDescriptor::Url(format!("{}/big.iso", server.base)),
            ))
            .unwrap();

        let moved = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(status) = relay.status("chat-1")
                    && status.bytes_moved > 0
                {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transfer never made progress");
        assert_eq!(moved.phase, Phase::Downloading);
        assert_eq!(moved.total_bytes, Some(data.len() as u64));

        assert!(relay.cancel("chat-1"));
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancel did not stop the transfer")
            .unwrap();

        assert!(result.is_cancelled());
        assert_eq!(result.summary(), "Transfer cancelled.");
        assert!(files_in(out.path()).is_empty());
        assert!(relay.registry().is_empty());
        assert!(!relay.cancel("chat-1"));
    }

    #[tokio::test]
    async fn missing_url_fails_without_retry() {
        let server = serve(payload(16), Behavior::NotFound).await;
        let out = TempDir::new().unwrap();
        let relay = relay(out.path(), Arc::new(Transcript::default()));

        let result = relay
            .submit(TransferRequest::new(
                "chat-1",
                SourceDescriptor::Url(format!("{}/gone.zip", server.base)),
            ))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(result.phase(), Phase::Failed);
        assert_eq!(
            result.outcome.as_ref().unwrap_err().kind(),
            ErrorKind::SourceRejected
        );
        assert!(files_in(out.path()).is_empty());
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn sessions_run_independently() {
        let data = payload(300 * 1024);
        let server = serve(Arc::clone(&data), Behavior::Normal).await;
        let out = TempDir::new().unwrap();
        let relay = relay(out.path(), Arc::new(Transcript::default()));

        let a = relay
            .submit(TransferRequest::new(
                "chat-a",
                SourceDescriptor::Url(format!("{}/a.bin", server.base)),
            ))
            .unwrap();
        let b = relay
            .submit(TransferRequest::new(
                "chat-b",
                SourceDescriptor::Url(format!("{}/b.bin", server.base)),
            ))
            .unwrap();

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.outcome.is_ok());
        assert!(b.outcome.is_ok());
        assert_eq!(files_in(out.path()), vec!["a.bin".to_string(), "b.bin".to_string()]);
        assert!(relay.registry().is_empty());
    }
}
