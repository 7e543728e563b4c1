use crate::engine::{CampaignStatus, Engine, FeedEvent, Pledge, Receipt};
use crate::error::{EngineError, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TCP_READ_TIMEOUT: u64 = 300;

/// Requests a client may send, one JSON value after another.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Submit { campaign_id: u64, pledge: Pledge },
    Status { campaign_id: u64 },
    /// Turn the connection into an event stream; nothing more is read
    Events { campaign_id: Option<u64> },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Accepted(Receipt),
    Rejected {
        code: String,
        reason: String,
        retryable: bool,
    },
    Status(CampaignStatus),
    Event(FeedEvent),
}

impl From<&EngineError> for Response {
    fn from(e: &EngineError) -> Self {
        Response::Rejected {
            code: e.code().to_string(),
            reason: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

/// Newline-delimited JSON front end for contributors and observers
pub struct Server {
    engine: Arc<Engine>,
}

impl Server {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn run(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| EngineError::Io(format!("Failed to bind to {addr}: {e}")))?;
        info!("Server listening on {addr}");
        self.serve(listener)
    }

    /// Accept connections on an already bound listener, a thread each.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let peer_addr = match stream.peer_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            error!("Failed to get peer address: {e}");
                            continue;
                        }
                    };

                    let engine = Arc::clone(&self.engine);
                    thread::spawn(move || {
                        if let Err(e) = Self::handle_connection(&engine, stream, peer_addr) {
                            warn!("Connection from {peer_addr} ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
        Ok(())
    }

    fn handle_connection(engine: &Engine, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        stream
            .set_read_timeout(Some(Duration::from_secs(TCP_READ_TIMEOUT)))
            .map_err(|e| EngineError::Io(format!("Failed to set read timeout: {e}")))?;

        let reader = BufReader::new(&stream);
        let requests = Deserializer::from_reader(reader).into_iter::<Request>();

        for request in requests {
            let request = match request {
                Ok(request) => request,
                Err(e) => {
                    let rejection = EngineError::MalformedPledge(format!("Unreadable request: {e}"));
                    Self::send(&stream, &Response::from(&rejection))?;
                    break;
                }
            };
            debug!("Request from {peer_addr}: {request:?}");

            match request {
                Request::Submit {
                    campaign_id,
                    pledge,
                } => {
                    let response = match engine.submit_pledge(campaign_id, &pledge) {
                        Ok(receipt) => Response::Accepted(receipt),
                        Err(e) => Response::from(&e),
                    };
                    Self::send(&stream, &response)?;
                }
                Request::Status { campaign_id } => {
                    let response = match engine.campaign_status(campaign_id) {
                        Ok(status) => Response::Status(status),
                        Err(e) => Response::from(&e),
                    };
                    Self::send(&stream, &response)?;
                }
                Request::Events { campaign_id } => {
                    return Self::stream_events(engine, &stream, peer_addr, campaign_id);
                }
            }
        }

        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    fn stream_events(
        engine: &Engine,
        stream: &TcpStream,
        peer_addr: SocketAddr,
        campaign_id: Option<u64>,
    ) -> Result<()> {
        let (observer, events) = engine.observe(campaign_id)?;
        info!("Streaming events to {peer_addr}");

        let mut result = Ok(());
        for event in events {
            if let Err(e) = Self::send(stream, &Response::Event(event)) {
                result = Err(e);
                break;
            }
        }
        engine.stop_observing(&observer)?;
        let _ = stream.shutdown(Shutdown::Both);
        result
    }

    fn send(mut stream: &TcpStream, response: &Response) -> Result<()> {
        let mut line = serde_json::to_vec(response)?;
        line.push(b'\n');
        stream
            .write_all(&line)
            .and_then(|_| stream.flush())
            .map_err(|e| EngineError::Io(format!("Failed to write response: {e}")))
    }
}
