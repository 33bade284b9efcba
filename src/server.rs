//! minikv TCP server
//!
//! Accepts connections with tokio, reads one command per line and answers
//! each with a text response. Depending on the configured topology every
//! connection gets its own store or all connections share one.

use crate::{
    config::{ServerConfig, StoreTopology},
    error::{MiniKvError, Result},
    protocol::{parse_command, Command, Response},
    store::{ExpiringStore, Store},
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{broadcast, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

const AUTOSAVE_FILE: &str = "autosave.json";

/// One client's view of the server: the store it talks to and the directory
/// its SAVE/LOAD files live in
struct Session {
    id: u64,
    store: Arc<ExpiringStore>,
    dir: PathBuf,
    /// The session owns its store and tears it down on disconnect
    owns_store: bool,
}

impl Session {
    /// Resolve a SAVE/LOAD file name inside the session directory
    fn file_path(&self, file: &str) -> Result<PathBuf> {
        let valid = !file.is_empty()
            && file != "."
            && file != ".."
            && !file.contains(|c: char| c == '/' || c == '\\');
        if !valid {
            return Err(MiniKvError::InvalidArgument(format!(
                "invalid file name '{}'",
                file
            )));
        }
        Ok(self.dir.join(file))
    }
}

/// minikv TCP server
pub struct MiniKvServer {
    config: ServerConfig,
    shared: Option<Arc<ExpiringStore>>,
    shutdown_tx: broadcast::Sender<()>,
    connection_limit: Arc<Semaphore>,
    next_session: AtomicU64,
}

impl MiniKvServer {
    /// Create a new server instance
    ///
    /// Under the shared topology the process-wide store is created here and,
    /// with autosave enabled, restored from the previous run.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let shared = match config.topology {
            StoreTopology::Shared => {
                let store = ExpiringStore::with_config(config.store.clone());
                let dir = config.data_dir.join("shared");
                tokio::fs::create_dir_all(&dir).await?;
                if config.autosave {
                    restore_autosave(&store, &dir).await;
                }
                Some(Arc::new(store))
            }
            StoreTopology::PerSession => None,
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            config,
            shared,
            shutdown_tx,
            connection_limit,
            next_session: AtomicU64::new(1),
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("minikv server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    ///
    /// On shutdown every open session is closed and awaited, so per-session
    /// stores are saved and their sweep tasks stopped before this returns.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr, &mut sessions).await,
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Client task failed: {}", e);
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("Client task failed: {}", e);
            }
        }

        info!("Server stopped");
        Ok(())
    }

    async fn accept(
        &self,
        mut stream: TcpStream,
        addr: std::net::SocketAddr,
        sessions: &mut JoinSet<()>,
    ) {
        let permit = match Arc::clone(&self.connection_limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Rejecting {}: connection limit reached", addr);
                let response = Response::Error("max connections reached".to_string());
                let _ = stream.write_all(&response.to_bytes()).await;
                return;
            }
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = match &self.shared {
            Some(store) => Session {
                id,
                store: Arc::clone(store),
                dir: self.config.data_dir.join("shared"),
                owns_store: false,
            },
            None => {
                let dir = self.config.data_dir.join(format!("client_{}", id));
                if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                    warn!("Could not create directory '{}': {}", dir.display(), e);
                }
                let store = ExpiringStore::with_config(self.config.store.clone());
                if self.config.autosave {
                    restore_autosave(&store, &dir).await;
                }
                Session {
                    id,
                    store: Arc::new(store),
                    dir,
                    owns_store: true,
                }
            }
        };

        info!(session = id, "New client connected: {}", addr);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let autosave = self.config.autosave;
        let max_line_bytes = self.config.max_line_bytes;

        sessions.spawn(async move {
            let served = Self::handle_client(stream, &session, shutdown_rx, max_line_bytes).await;
            if let Err(e) = served {
                error!("Error handling client {}: {}", addr, e);
            }
            if session.owns_store {
                if autosave {
                    write_autosave(&session.store, &session.dir).await;
                }
                session.store.shutdown().await;
            }
            info!(session = session.id, "Client disconnected: {}", addr);
            drop(permit);
        });
    }

    /// Handle a single client connection
    ///
    /// A line longer than `max_line_bytes` is answered with an error and ends
    /// the connection.
    async fn handle_client(
        mut stream: TcpStream,
        session: &Session,
        mut shutdown_rx: broadcast::Receiver<()>,
        max_line_bytes: usize,
    ) -> Result<()> {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();
        let limit = u64::try_from(max_line_bytes).unwrap_or(u64::MAX);

        loop {
            line.clear();
            let mut limited = (&mut buf_reader).take(limit);

            tokio::select! {
                result = limited.read_line(&mut line) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) if n >= max_line_bytes && !line.ends_with('\n') => {
                            warn!(session = session.id, "Dropping client: line exceeds {} bytes", max_line_bytes);
                            let response = Response::Error(format!(
                                "line exceeds {} bytes",
                                max_line_bytes
                            ));
                            writer.write_all(&response.to_bytes()).await?;
                            writer.flush().await?;
                            break;
                        }
                        Ok(_) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let response = Self::process_command(&line, session).await;
                            writer.write_all(&response.to_bytes()).await?;
                            writer.flush().await?;

                            if response == Response::Goodbye {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to read from client: {}", e);
                            break;
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    debug!(session = session.id, "Closing client connection for shutdown");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Process a command line from a client
    async fn process_command(line: &str, session: &Session) -> Response {
        match parse_command(line) {
            Ok(command) => Self::execute_command(command, session).await,
            Err(e) => Response::Error(e.to_string()),
        }
    }

    /// Execute a parsed command
    async fn execute_command(command: Command, session: &Session) -> Response {
        let store = &session.store;
        match command {
            Command::Set { key, value, ttl: None } => {
                debug!(session = session.id, %key, kind = value.type_name(), "SET");
                store.set(key, value).await;
                Response::Ok
            }
            Command::Set { key, value, ttl: Some(ttl) } => {
                debug!(session = session.id, %key, kind = value.type_name(), ttl, "SET with TTL");
                store.set_with_ttl(key, value, ttl).await;
                Response::Ok
            }
            Command::Get { key } => match store.get(&key).await {
                Some(value) => Response::Value(value),
                None => Response::Nil,
            },
            Command::Delete { key } => Response::flag(store.delete(&key).await),
            Command::Exists { key } => Response::flag(store.exists(&key).await),
            Command::Expire { ttl, .. } if ttl <= 0 => {
                Response::Error("TTL must be positive".to_string())
            }
            Command::Expire { key, ttl } => Response::flag(store.expire(&key, ttl).await),
            Command::Size => Response::Integer(count(store.len().await)),
            Command::Show => Response::Entries(store.snapshot().await),
            Command::Save { file } => {
                let result = match session.file_path(&file) {
                    Ok(path) => save_in_dir(store, &session.dir, &path).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => Response::Ok,
                    Err(e) => Response::Error(format!("could not save '{}': {}", file, e)),
                }
            }
            Command::Load { file } => {
                let result = match session.file_path(&file) {
                    Ok(path) => store.load_from_file(&path).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(loaded) => Response::Integer(count(loaded)),
                    Err(e) => Response::Error(format!("could not load '{}': {}", file, e)),
                }
            }
            Command::Quit => Response::Goodbye,
        }
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).map_err(|_| {
            MiniKvError::Server("Failed to send shutdown signal".to_string())
        })?;
        Ok(())
    }

    /// Persist and stop the shared store, if there is one
    pub async fn close(&self) {
        if let Some(store) = &self.shared {
            if self.config.autosave {
                write_autosave(store, &self.config.data_dir.join("shared")).await;
            }
            store.shutdown().await;
        }
    }
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

async fn save_in_dir(store: &ExpiringStore, dir: &Path, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    store.save_to_file(path).await
}

async fn restore_autosave(store: &ExpiringStore, dir: &Path) {
    let path = dir.join(AUTOSAVE_FILE);
    match store.load_from_file(&path).await {
        Ok(count) => info!("Restored {} keys from {}", count, path.display()),
        Err(MiniKvError::SnapshotNotFound(_)) => debug!("No autosave at {}", path.display()),
        Err(e) => warn!("Could not restore {}: {}", path.display(), e),
    }
}

async fn write_autosave(store: &ExpiringStore, dir: &Path) {
    let path = dir.join(AUTOSAVE_FILE);
    match save_in_dir(store, dir, &path).await {
        Ok(()) => info!("Autosaved data to {}", path.display()),
        Err(e) => warn!("Failed to autosave data to {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use tempfile::TempDir;

    fn test_session(dir: &Path) -> Session {
        Session {
            id: 1,
            store: Arc::new(ExpiringStore::without_sweeper()),
            dir: dir.to_path_buf(),
            owns_store: true,
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            topology: StoreTopology::Shared,
            max_connections: 10,
            ..ServerConfig::default()
        };

        let server = MiniKvServer::new(config).await.unwrap();
        assert!(dir.path().join("shared").is_dir());
        // The shutdown might fail if there are no receivers, which is fine for this test
        let _ = server.shutdown();
        server.close().await;
        assert!(dir.path().join("shared").join(AUTOSAVE_FILE).exists());
    }

    #[tokio::test]
    async fn test_command_processing() {
        let dir = TempDir::new().unwrap();
        let session = test_session(dir.path());

        let response = MiniKvServer::process_command("SET key1 value1", &session).await;
        assert_eq!(response, Response::Ok);

        let response = MiniKvServer::process_command("GET key1", &session).await;
        assert_eq!(response, Response::Value(Value::from("value1")));

        let response = MiniKvServer::process_command("EXISTS key1", &session).await;
        assert_eq!(response, Response::Integer(1));

        let response = MiniKvServer::process_command("SIZE", &session).await;
        assert_eq!(response, Response::Integer(1));

        let response = MiniKvServer::process_command("DEL key1", &session).await;
        assert_eq!(response, Response::Integer(1));

        let response = MiniKvServer::process_command("DEL key1", &session).await;
        assert_eq!(response, Response::Integer(0));

        let response = MiniKvServer::process_command("GET key1", &session).await;
        assert_eq!(response, Response::Nil);
    }

    #[tokio::test]
    async fn test_expire_rejects_non_positive_ttl() {
        let dir = TempDir::new().unwrap();
        let session = test_session(dir.path());
        MiniKvServer::process_command("SET k 1", &session).await;

        for line in ["EXPIRE k 0", "EXPIRE k -5"] {
            let response = MiniKvServer::process_command(line, &session).await;
            assert!(matches!(response, Response::Error(_)), "{} was accepted", line);
        }
        assert_eq!(
            MiniKvServer::process_command("EXPIRE k 10", &session).await,
            Response::Integer(1)
        );
        assert_eq!(
            MiniKvServer::process_command("EXPIRE missing 10", &session).await,
            Response::Integer(0)
        );
    }

    #[tokio::test]
    async fn test_set_with_non_positive_ttl_is_accepted() {
        let dir = TempDir::new().unwrap();
        let session = test_session(dir.path());

        let response = MiniKvServer::process_command("SET k v 0", &session).await;
        assert_eq!(response, Response::Ok);
        assert_eq!(
            MiniKvServer::process_command("EXISTS k", &session).await,
            Response::Integer(0)
        );
    }

    #[tokio::test]
    async fn test_save_and_load_commands() {
        let dir = TempDir::new().unwrap();
        let session = test_session(dir.path());

        MiniKvServer::process_command("SET a 1", &session).await;
        MiniKvServer::process_command("SET b \"two words\"", &session).await;
        assert_eq!(
            MiniKvServer::process_command("SAVE backup.json", &session).await,
            Response::Ok
        );
        assert!(dir.path().join("backup.json").exists());

        MiniKvServer::process_command("DEL a", &session).await;
        assert_eq!(
            MiniKvServer::process_command("LOAD backup.json", &session).await,
            Response::Integer(2)
        );
        assert_eq!(
            MiniKvServer::process_command("SHOW", &session).await,
            Response::Entries(vec![
                ("a".to_string(), Value::Int(1)),
                ("b".to_string(), Value::from("two words")),
            ])
        );
    }

    #[tokio::test]
    async fn test_file_names_stay_in_session_dir() {
        let dir = TempDir::new().unwrap();
        let session = test_session(dir.path());

        for line in ["SAVE ../escape.json", "SAVE ..", "LOAD /etc/passwd"] {
            let response = MiniKvServer::process_command(line, &session).await;
            assert!(matches!(response, Response::Error(_)), "{} was accepted", line);
        }

        let response = MiniKvServer::process_command("LOAD missing.json", &session).await;
        assert!(matches!(response, Response::Error(_)));
    }

    #[tokio::test]
    async fn test_parse_errors_become_error_responses() {
        let dir = TempDir::new().unwrap();
        let session = test_session(dir.path());

        assert!(matches!(
            MiniKvServer::process_command("BOGUS", &session).await,
            Response::Error(_)
        ));
        assert_eq!(
            MiniKvServer::process_command("quit", &session).await,
            Response::Goodbye
        );
    }
}
