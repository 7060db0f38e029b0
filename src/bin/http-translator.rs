//! HTTP-to-bus gateway for clients that can't hold a bus connection
//! open: one POST in, one (or many, if multipart) bus round trip out.
//!
//! The protocol and session logic lives in `opensrf::http_translator`;
//! this binary owns the TCP/HTTP framing and wires a `TcpStream` up as
//! a `ReplyWriter`.
use getopts;
use opensrf as osrf;
use osrf::cache::Cache;
use osrf::client::Client;
use osrf::http_translator::{
    IncomingRequest, Outcome, ReplyWriter, Translator, HEADER_FROM, PLAIN_CONTENT_TYPE,
};
use osrf::init;
use osrf::logging::Logger;
use osrf::sclient::{HostSettings, SettingsClient};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use threadpool::ThreadPool;

const DEFAULT_PORT: u16 = 7680;
const DEFAULT_ADDRESS: &str = "127.0.0.1";

/// How many simultaneous HTTP connections we'll service at once.
const MAX_CLIENTS: usize = 256;

/// Read buffer chunk size while pulling the request off the wire.
const BUFSIZE: usize = 1024;

/// Refuse to buffer a request larger than this many bytes.
const MAX_REQUEST_SIZE: usize = 10485760; // ~10M

struct ParsedHttpRequest {
    headers: Vec<(String, String)>,
    body: String,
}

impl ParsedHttpRequest {
    /// Case-insensitive header lookup.
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }
}

/// Pulls one full HTTP request (headers + Content-Length body) off the
/// stream.  Mirrors the read-until-content-length loop used by other
/// raw-socket HTTP servers in this codebase: httparse only tells us
/// the request is well-formed once we've read enough of it.
fn read_http_request(stream: &mut TcpStream) -> Result<ParsedHttpRequest, String> {
    let mut raw: Vec<u8> = Vec::new();
    let mut header_byte_count = 0;
    let mut content_length = 0;
    let mut headers: Option<Vec<(String, String)>> = None;

    loop {
        if headers.is_none() || raw.len() < header_byte_count + content_length {
            let mut buffer = [0u8; BUFSIZE];
            let num_bytes = stream
                .read(&mut buffer)
                .map_err(|e| format!("Error reading HTTP stream: {e}"))?;

            if num_bytes == 0 {
                return Err("Connection closed before request was complete".to_string());
            }

            raw.extend_from_slice(&buffer[..num_bytes]);

            if raw.len() > MAX_REQUEST_SIZE {
                return Err("Request exceeds maximum allowed size".to_string());
            }
        }

        if headers.is_none() {
            let mut raw_headers = [httparse::EMPTY_HEADER; 64];
            let mut req = httparse::Request::new(&mut raw_headers);

            let res = req
                .parse(&raw)
                .map_err(|e| format!("Error parsing HTTP headers: {e}"))?;

            if res.is_partial() {
                continue;
            }

            header_byte_count = res.unwrap();

            let mut collected = Vec::new();
            for header in req.headers.iter() {
                collected.push((
                    header.name.to_string(),
                    String::from_utf8_lossy(header.value).to_string(),
                ));
            }

            content_length = collected
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.parse::<usize>().ok())
                .unwrap_or(0);

            headers = Some(collected);
        }

        if raw.len() >= header_byte_count + content_length {
            let body_bytes = &raw[header_byte_count..header_byte_count + content_length];

            return Ok(ParsedHttpRequest {
                headers: headers.unwrap(),
                body: String::from_utf8_lossy(body_bytes).to_string(),
            });
        }
    }
}

/// Extracts the `osrf-msg` value from an `application/x-www-form-urlencoded`
/// body, decoding percent/plus escaping along the way.
fn extract_osrf_msg(body: &str) -> Option<String> {
    for pair in body.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");

        if osrf::xmlobj::unquote_plus(key) == "osrf-msg" {
            return Some(osrf::xmlobj::unquote_plus(value));
        }
    }

    None
}

/// Writes HTTP response bytes directly to the client socket, following
/// the translator's non-multipart-vs-multipart framing rules.
struct TcpReplyWriter<'a> {
    stream: &'a mut TcpStream,
    from: String,
    delim: String,
    started: bool,
}

impl<'a> TcpReplyWriter<'a> {
    fn new(stream: &'a mut TcpStream) -> Self {
        TcpReplyWriter {
            stream,
            from: String::new(),
            delim: String::new(),
            started: false,
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), String> {
        self.stream
            .write_all(bytes)
            .map_err(|e| format!("Error writing to client: {e}"))
    }
}

impl<'a> ReplyWriter for TcpReplyWriter<'a> {
    fn start(&mut self, from: &str, multipart: bool, delim: &str) -> Result<(), String> {
        self.from = from.to_string();
        self.delim = delim.to_string();
        self.started = true;

        if multipart {
            let head = format!(
                "HTTP/1.1 200 OK\r\n{HEADER_FROM}: {from}\r\n\
                 Content-type: multipart/x-mixed-replace;boundary=\"{delim}\"\r\n\r\n--{delim}\n"
            );
            self.write_all(head.as_bytes())
        } else {
            // Content-Length isn't known until the full body is
            // aggregated; the status line and headers are written in
            // write_final() instead.
            Ok(())
        }
    }

    fn write_chunk(&mut self, body: &str, last: bool) -> Result<(), String> {
        let boundary_line = if last {
            format!("--{}--\n", self.delim)
        } else {
            format!("--{}\n", self.delim)
        };

        let chunk = format!("Content-type: {PLAIN_CONTENT_TYPE}\n\n{body}\n\n{boundary_line}");

        self.write_all(chunk.as_bytes())
    }

    fn write_final(&mut self, body: &str) -> Result<(), String> {
        let head = format!(
            "HTTP/1.1 200 OK\r\n{HEADER_FROM}: {}\r\nContent-type: {PLAIN_CONTENT_TYPE}\r\n\
             Content-Length: {}\r\n\r\n",
            self.from,
            body.as_bytes().len()
        );

        self.write_all(head.as_bytes())?;
        self.write_all(body.as_bytes())
    }
}

fn status_line(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Ok => "HTTP/1.1 200 OK\r\n\r\n",
        Outcome::BadRequest(_) => "HTTP/1.1 400 Bad Request\r\n\r\n",
        Outcome::NotFound(_) => "HTTP/1.1 404 Not Found\r\n\r\n",
        Outcome::GatewayTimeout => "HTTP/1.1 504 Gateway Timeout\r\n\r\n",
        Outcome::WriteError(_) => "HTTP/1.1 500 Internal Server Error\r\n\r\n",
    }
}

fn handle_connection(
    mut stream: TcpStream,
    gateway: &osrf::conf::BusClient,
    host_settings: &Arc<HostSettings>,
) -> Result<(), String> {
    let remote_ip = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string());

    let http_req = read_http_request(&mut stream)?;

    let osrf_msg = extract_osrf_msg(&http_req.body).unwrap_or_default();

    let req = IncomingRequest::new(&remote_ip, osrf_msg, |name| http_req.header(name));

    let cache = Cache::init(host_settings.clone())?;
    let mut translator = Translator::new(gateway, cache)?;

    let mut writer = TcpReplyWriter::new(&mut stream);
    let outcome = translator.process(&req, &mut writer);

    match &outcome {
        Outcome::Ok => {}
        other => {
            log::warn!("http-translator: request from {remote_ip} failed: {other}");
            if !writer.started {
                writer.write_all(status_line(other).as_bytes())?;
            }
        }
    }

    stream.shutdown(std::net::Shutdown::Both).ok();

    Ok(())
}

struct Server {
    gateway: Arc<osrf::conf::BusClient>,
    host_settings: Arc<HostSettings>,
    address: String,
    port: u16,
    max_clients: usize,
}

impl Server {
    fn run(&mut self) {
        let host = format!("{}:{}", self.address, self.port);

        log::info!("HTTP translator listening at {host}");

        let listener = TcpListener::bind(&host).expect("Could not bind HTTP translator listener");

        let pool = ThreadPool::new(self.max_clients);

        for connection in listener.incoming() {
            let stream = match connection {
                Ok(s) => s,
                Err(e) => {
                    log::error!("Error accepting new connection: {e}");
                    continue;
                }
            };

            let tcount = pool.active_count() + pool.queued_count();

            if tcount >= self.max_clients {
                log::warn!("Max HTTP translator clients reached.  Dropping new connection");
                continue;
            }

            let gateway = self.gateway.clone();
            let host_settings = self.host_settings.clone();

            pool.execute(move || {
                Logger::mk_log_trace();
                if let Err(e) = handle_connection(stream, &gateway, &host_settings) {
                    log::error!("Error handling HTTP translator request: {e}");
                }
            });
        }
    }
}

fn main() {
    let mut ops = getopts::Options::new();

    ops.optopt("p", "port", "Port", "PORT");
    ops.optopt("a", "address", "Listen Address", "ADDRESS");
    ops.optopt("", "max-clients", "Max Clients", "MAX_CLIENTS");

    let initops = init::InitOptions {
        skip_logging: true,
        appname: Some(String::from("http-translator")),
    };

    let (config, params) = init::init_with_more_options(&mut ops, &initops).unwrap();
    let config = config.into_shared();

    let gateway = config.gateway().expect("No gateway configuration found");

    let logger = Logger::new(gateway.logging()).expect("Creating logger");
    logger.init().expect("Logger Init");

    let client = Client::connect(config.clone()).expect("Connecting to OpenSRF");

    let host_settings = SettingsClient::get_host_settings(&client, false)
        .expect("Error fetching host settings")
        .into_shared();

    let address = params
        .opt_get_default("a", DEFAULT_ADDRESS.to_string())
        .unwrap();

    let port = params
        .opt_get_default("p", DEFAULT_PORT.to_string())
        .unwrap();
    let port = port.parse::<u16>().expect("Invalid port number");

    let max_clients = match params.opt_str("max-clients") {
        Some(mc) => mc.parse::<usize>().expect("Invalid max-clients value"),
        None => MAX_CLIENTS,
    };

    let mut server = Server {
        gateway: Arc::new(gateway.clone()),
        host_settings,
        address,
        port,
        max_clients,
    };

    server.run();
}
