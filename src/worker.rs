use super::addr::BusAddress;
use super::app;
use super::client::{Client, ClientSingleton};
use super::conf;
use super::logging::Logger;
use super::message;
use super::message::Message;
use super::message::MessageStatus;
use super::message::MessageType;
use super::message::Payload;
use super::message::TransportMessage;
use super::method;
use super::method::ParamCount;
use super::sclient::HostSettings;
use super::session::ServerSession;
use super::util;
use std::cell::RefMut;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A Worker runs in its own forked child process and responds to the
/// requests our controller dispatches to us over a private data
/// socket, one at a time, lingering in a keepalive loop for the life
/// of any CONNECTED conversation before reporting back idle.
pub struct Worker {
    service: String,

    config: Arc<conf::Config>,

    /// Has our controller asked us to clean up and exit?  Checked
    /// between requests; a child already mid-request runs it to
    /// completion first.
    stopping: Arc<AtomicBool>,

    /// Settings from opensrf.settings
    host_settings: Arc<HostSettings>,

    /// Our own drone connection to the bus, established fresh after
    /// fork.  Never shared with the controller or with siblings.
    client: Client,

    /// True if the caller has requested a stateful conversation.
    connected: bool,

    methods: Arc<HashMap<String, method::Method>>,

    /// Currently active session.
    /// A worker can only have one active session at a time.
    /// For stateless requests, each new thread results in a new session.
    /// Starting a new thread/session in a stateful conversation
    /// results in an error.
    session: Option<ServerSession>,

    /// Our own pid, used for logging and for status reporting.
    worker_id: u32,

    /// Our end of the socketpair our controller created just for us.
    /// One dispatched request frame is read from here per request.
    data_stream: UnixStream,

    /// The write end of the status socketpair, shared by every child
    /// our controller has forked.  Writes are serialized with an
    /// exclusive flock on the fd.
    status_stream: UnixStream,

    /// Seconds to wait for a follow-up message while CONNECTED before
    /// sending STATUS 408 and tearing the conversation down.
    keepalive: i32,
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Worker ({})", self.worker_id)
    }
}

impl Worker {
    /// Builds a Worker for use in a freshly-forked child process.
    ///
    /// Must be called only after fork(), never before, so the bus
    /// connection created here is never shared with the controller or
    /// another child.
    pub fn new(
        service: String,
        config: Arc<conf::Config>,
        host_settings: Arc<HostSettings>,
        stopping: Arc<AtomicBool>,
        methods: Arc<HashMap<String, method::Method>>,
        data_stream: UnixStream,
        status_stream: UnixStream,
        keepalive: i32,
    ) -> Result<Worker, String> {
        let client = Client::connect(config.clone())?;

        Ok(Worker {
            config,
            host_settings,
            stopping,
            service,
            methods,
            client,
            data_stream,
            status_stream,
            keepalive,
            worker_id: std::process::id(),
            session: None,
            connected: false,
        })
    }

    /// Mutable Ref to our under-the-covers client singleton.
    fn client_internal_mut(&self) -> RefMut<ClientSingleton> {
        self.client.singleton().borrow_mut()
    }

    /// Current session
    ///
    /// Panics of session on None.
    fn session(&self) -> &ServerSession {
        self.session.as_ref().unwrap()
    }

    fn session_mut(&mut self) -> &mut ServerSession {
        self.session.as_mut().unwrap()
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Create and new ApplicationWorker instance and initialize
    /// its environment.
    pub fn create_app_worker(
        &mut self,
        factory: app::ApplicationWorkerFactory,
        env: Box<dyn app::ApplicationEnv>,
    ) -> Result<Box<dyn app::ApplicationWorker>, String> {
        let mut app_worker = (factory)();
        app_worker.absorb_env(
            self.client.clone(),
            self.config.clone(),
            self.host_settings.clone(),
            self.methods.clone(),
            env,
        )?;
        Ok(app_worker)
    }

    /// Runs the per-request loop until `max_requests` dispatched
    /// conversations have been handled or the controller signals a
    /// stop, then exits cleanly so the controller can reap and
    /// respawn us.
    pub fn listen(&mut self, mut appworker: Box<dyn app::ApplicationWorker>, max_requests: u32) {
        let selfstr = format!("{self}");

        if let Err(e) = appworker.worker_start() {
            log::error!("{selfstr} worker_start failed {e}.  Exiting");
            return;
        }

        let mut requests: u32 = 0;

        while requests < max_requests {
            if self.stopping.load(Ordering::Relaxed) {
                log::info!("{selfstr} received a stop signal");
                break;
            }

            let tmsg = match self.read_dispatch() {
                Ok(Some(t)) => t,
                Ok(None) => {
                    log::debug!("{selfstr} controller closed our data socket; exiting");
                    break;
                }
                Err(e) => {
                    log::error!("{selfstr} error reading dispatched request: {e}");
                    break;
                }
            };

            if let Err(e) = self.handle_transport_message(tmsg, &mut appworker) {
                log::error!("{selfstr} error handling message: {e}");
                self.connected = false;
            }

            if self.connected {
                if let Err(e) = self.run_keepalive_loop(&mut appworker) {
                    log::error!("{selfstr} error in keepalive loop: {e}");
                }
            }

            self.session = None;

            if let Err(e) = appworker.end_session() {
                log::error!("{selfstr} end_session() returned an error: {e}");
                break;
            }

            // An inbound message may have modified our thread-scoped
            // locale.  Reset it so it does not leak into the next
            // conversation handled by this same child.
            message::reset_thread_locale();

            requests += 1;

            if let Err(e) = self.report_idle() {
                log::error!("{selfstr} failed reporting idle status: {e}");
                break;
            }
        }

        log::debug!("{self} exiting listen loop and cleaning up");

        if let Err(e) = appworker.worker_end() {
            log::error!("{selfstr} worker_end failed {e}");
        }

        // Clear our worker-specific bus address of any lingering data.
        self.reset().ok();
    }

    /// Blocking-reads one length-prefixed frame from our data socket
    /// and parses it as a TransportMessage.  Returns None on a clean
    /// EOF, meaning the controller closed its end.
    fn read_dispatch(&mut self) -> Result<Option<TransportMessage>, String> {
        let mut size_buf = [0u8; util::SIZE_PAD];

        if let Err(e) = self.data_stream.read_exact(&mut size_buf) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(format!("error reading frame size: {e}"));
        }

        let size_str = std::str::from_utf8(&size_buf)
            .or_else(|e| Err(format!("frame size bytes are not valid UTF-8: {e}")))?;

        let size: usize = size_str
            .trim()
            .parse()
            .or_else(|e| Err(format!("invalid frame size '{size_str}': {e}")))?;

        let mut payload = vec![0u8; size];

        self.data_stream
            .read_exact(&mut payload)
            .or_else(|e| Err(format!("error reading frame payload: {e}")))?;

        let xml = String::from_utf8(payload)
            .or_else(|e| Err(format!("frame payload is not valid UTF-8: {e}")))?;

        match TransportMessage::from_xml(&xml) {
            Some(tmsg) => Ok(Some(tmsg)),
            None => Err(format!("could not parse dispatched frame: {xml}")),
        }
    }

    /// Writes our pid, formatted into a SIZE_PAD-byte frame, onto the
    /// shared status socket, telling our controller we're ready for
    /// more work.  Guarded by an exclusive advisory lock on the fd so
    /// sibling children's writes never interleave.
    fn report_idle(&mut self) -> Result<(), String> {
        let msg = util::format_size_pad(self.worker_id as usize);
        let fd = self.status_stream.as_raw_fd();

        if unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
            return Err(format!(
                "flock() on status socket failed: {}",
                std::io::Error::last_os_error()
            ));
        }

        let result = self
            .status_stream
            .write_all(msg.as_bytes())
            .or_else(|e| Err(format!("error writing idle status: {e}")));

        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }

        result
    }

    /// While the session we just handled remains CONNECTED, wait up to
    /// `keepalive` seconds for a follow-up message addressed directly
    /// to our own drone address.  This is how a connected client
    /// reaches us again without involving the controller.
    fn run_keepalive_loop(
        &mut self,
        appworker: &mut Box<dyn app::ApplicationWorker>,
    ) -> Result<(), String> {
        let my_addr = self.client.address().as_str().to_string();

        while self.connected {
            if self.stopping.load(Ordering::Relaxed) {
                self.connected = false;
                return Ok(());
            }

            let recv_result = self
                .client_internal_mut()
                .bus_mut()
                .recv(self.keepalive, Some(&my_addr));

            let tmsg = match recv_result {
                Ok(Some(t)) => t,
                Ok(None) => {
                    log::warn!("{self} timeout waiting on request while connected");

                    self.reply_with_status(MessageStatus::Timeout, "Timeout")?;
                    self.connected = false;

                    if let Err(e) = appworker.keepalive_timeout() {
                        log::error!("{self} keepalive_timeout() returned an error: {e}");
                    }

                    return Ok(());
                }
                Err(e) => {
                    self.connected = false;
                    return Err(format!("bus recv() failed in keepalive loop: {e}"));
                }
            };

            if let Err(e) = self.handle_transport_message(tmsg, appworker) {
                log::error!("{self} error handling message in keepalive loop: {e}");
                self.connected = false;
                return Ok(());
            }
        }

        Ok(())
    }

    fn handle_transport_message(
        &mut self,
        mut tmsg: message::TransportMessage,
        appworker: &mut Box<dyn app::ApplicationWorker>,
    ) -> Result<(), String> {
        // Always adopt the log trace of an inbound API call.
        Logger::set_log_trace(tmsg.osrf_xid());

        if self.session.is_none() || self.session().thread().ne(tmsg.thread()) {
            log::trace!("server: creating new server session for {}", tmsg.thread());

            self.session = Some(ServerSession::new(
                self.client.clone(),
                &self.service,
                tmsg.thread(),
                0, // thread trace -- updated later as needed
                BusAddress::from_str(tmsg.from())?,
            ));

            appworker.start_session()?;
        }

        for msg in tmsg.body_mut().drain(..) {
            self.handle_message(msg, appworker)?;
        }

        Ok(())
    }

    // Clear our local message bus and reset state maintenance values.
    fn reset(&mut self) -> Result<(), String> {
        self.connected = false;
        self.session = None;
        self.client.clear()
    }

    fn handle_message(
        &mut self,
        msg: message::Message,
        appworker: &mut Box<dyn app::ApplicationWorker>,
    ) -> Result<(), String> {
        self.session_mut().set_last_thread_trace(msg.thread_trace());
        self.session_mut().clear_responded_complete();

        log::trace!("{self} received message of type {:?}", msg.mtype());

        match msg.mtype() {
            message::MessageType::Disconnect => {
                log::trace!("{self} received a DISCONNECT");
                self.reset()?;
                Ok(())
            }

            message::MessageType::Connect => {
                log::trace!("{self} received a CONNECT");

                if self.connected {
                    return self.reply_bad_request("Worker is already connected");
                }

                self.connected = true;
                self.reply_with_status(MessageStatus::Ok, "OK")
            }

            message::MessageType::Request => {
                log::trace!("{self} received a REQUEST");
                self.handle_request(msg, appworker)
            }

            _ => self.reply_bad_request("Unexpected message type"),
        }
    }

    fn reply_with_status(&mut self, stat: MessageStatus, stat_text: &str) -> Result<(), String> {
        let tmsg = TransportMessage::with_body(
            self.session().sender().as_str(),
            self.client.address().as_str(),
            self.session().thread(),
            Message::new(
                MessageType::Status,
                self.session().last_thread_trace(),
                Payload::Status(message::Status::new(stat, stat_text, "osrfStatus")),
            ),
        );

        self.client_internal_mut()
            .get_domain_bus(self.session().sender().domain())?
            .send(&tmsg)
    }

    fn handle_request(
        &mut self,
        mut msg: message::Message,
        appworker: &mut Box<dyn app::ApplicationWorker>,
    ) -> Result<(), String> {
        let method_call = match msg.payload_mut() {
            message::Payload::Method(m) => m,
            _ => return self.reply_bad_request("Request sent without a MethoCall payload"),
        };

        let mut params = method_call.take_params();
        let param_count = params.len();
        let api_name = method_call.method();

        let log_params = util::stringify_params(api_name, &params, self.config.log_protect());

        // Log the API call
        log::info!("CALL: {} {}", api_name, log_params);

        // Before we begin processing a service-level request, clear our
        // local message bus to avoid encountering any stale messages
        // lingering from the previous conversation.
        if !self.connected {
            self.client.clear()?;
        }

        // Clone the method since we have mutable borrows below.  Note
        // this is the method definition, not the param-laden request.
        let mut method = self.methods.get(api_name).map(|m| m.clone());

        if method.is_none() {
            // Atomic methods are not registered/published in advance
            // since every method has an atomic variant.
            // Find the root method and use it.
            if api_name.ends_with(".atomic") {
                let meth = api_name.replace(".atomic", "");
                if let Some(m) = self.methods.get(&meth) {
                    method = Some(m.clone());

                    // Creating a new queue tells our session to treat
                    // this as an atomic request.
                    self.session_mut().new_atomic_resp_queue();
                }
            }
        }

        if method.is_none() {
            log::warn!("Method not found: {}", api_name);

            return self.reply_with_status(
                MessageStatus::MethodNotFound,
                &format!("Method not found: {}", api_name),
            );
        }

        let method = method.unwrap();

        let pcount = method.param_count();

        // Make sure the number of params sent by the caller matches the
        // parameter count for the method.
        if !ParamCount::matches(&pcount, param_count as u8) {
            return self.reply_bad_request(&format!(
                "Invalid param count sent: method={} sent={} needed={}",
                api_name, param_count, &pcount,
            ));
        }

        // Drain the parameters, deserialize/unpack them, and stack them
        // back into our method call.
        let mut unpacked_params = Vec::new();
        if let Some(s) = self.client.singleton().borrow().serializer() {
            for p in params.drain(..) {
                unpacked_params.push(s.unpack(p));
            }
        }
        method_call.set_params(unpacked_params);

        if let Err(ref err) = (method.handler())(appworker, self.session_mut(), &method_call) {
            let msg = format!("{self} method {} failed with {err}", method_call.method());
            log::error!("{msg}");
            appworker.api_call_error(&method_call, err);
            self.reply_server_error(&msg)?;
            Err(msg)?;
        }

        if !self.session().responded_complete() {
            self.session_mut().send_complete()
        } else {
            Ok(())
        }
    }

    fn reply_server_error(&mut self, text: &str) -> Result<(), String> {
        self.connected = false;

        let msg = Message::new(
            MessageType::Status,
            self.session().last_thread_trace(),
            Payload::Status(message::Status::new(
                MessageStatus::InternalServerError,
                &format!("Internal Server Error: {text}"),
                "osrfStatus",
            )),
        );

        let tmsg = TransportMessage::with_body(
            self.session().sender().as_str(),
            self.client.address().as_str(),
            self.session().thread(),
            msg,
        );

        self.client_internal_mut()
            .get_domain_bus(self.session().sender().domain())?
            .send(&tmsg)
    }

    fn reply_bad_request(&mut self, text: &str) -> Result<(), String> {
        self.connected = false;

        let msg = Message::new(
            MessageType::Status,
            self.session().last_thread_trace(),
            Payload::Status(message::Status::new(
                MessageStatus::BadRequest,
                &format!("Bad Request: {text}"),
                "osrfStatus",
            )),
        );

        let tmsg = TransportMessage::with_body(
            self.session().sender().as_str(),
            self.client.address().as_str(),
            self.session().thread(),
            msg,
        );

        self.client_internal_mut()
            .get_domain_bus(self.session().sender().domain())?
            .send(&tmsg)
    }
}
