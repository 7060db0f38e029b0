use super::addr::BusAddress;
use super::app;
use super::client::{Client, ClientSingleton};
use super::conf;
use super::init;
use super::message;
use super::method;
use super::sclient::{HostSettings, SettingsClient};
use super::session;
use super::util;
use super::worker::Worker;
use signal_hook;
use std::cell::RefMut;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

/// How often the controller wakes to check for reaping/respawning and
/// shutdown signals when no request is waiting on the bus.
const IDLE_WAKE_TIME: i32 = 3;
/// Max time in seconds to allow active children to finish their current
/// request before we SIGKILL whatever is left.
const SHUTDOWN_MAX_WAIT: i32 = 30;
const DEFAULT_MIN_CHILDREN: usize = 1;
const DEFAULT_MAX_CHILDREN: usize = 30;
const DEFAULT_MAX_REQUESTS: u32 = 5000;
const DEFAULT_KEEPALIVE: i32 = 5;

/// A forked worker child known to the controller.
struct Child {
    pid: libc::pid_t,

    /// Our end of the per-child data socketpair; the child's other end
    /// becomes its `Worker::data_stream`.
    stream: UnixStream,
}

/// Forking supervisor for an OpenSRF service.
///
/// The controller is the only process that listens on the service's
/// bus address.  It forks worker children up front, then dispatches
/// each inbound request to an idle child over a private Unix domain
/// socket.  A stateful CONNECT handshake hands subsequent messages in
/// the same conversation directly to that child's own bus address, so
/// the controller drops out of the loop until the child reports idle
/// again.
pub struct Controller {
    application: Box<dyn app::Application>,
    methods: Option<Arc<HashMap<String, method::Method>>>,
    config: Arc<conf::Config>,
    client: Client,
    service: String,

    /// Children ready to receive a new dispatch.
    idle_list: Vec<Child>,
    /// Children currently processing a dispatched request.
    active_list: Vec<Child>,

    /// Our end of the status socketpair; every child inherits a dup of
    /// the other end at fork time and reports its pid here once it's
    /// ready for more work.  Non-blocking.
    read_status: UnixStream,

    /// Never written to.  Kept open only so `read_status` doesn't see
    /// EOF when every child happens to be between requests.
    write_status: UnixStream,

    /// Bus address workers share while awaiting their first dispatch
    /// in a conversation; pre-computed once at startup.
    service_addr: String,

    stopping: Arc<AtomicBool>,
    host_settings: Arc<HostSettings>,

    min_children: usize,
    max_children: usize,
    max_requests: u32,
    keepalive: i32,
}

impl Controller {
    pub fn start(application: Box<dyn app::Application>) -> Result<(), String> {
        let service = application.name().to_string();

        let mut options = init::InitOptions::new();
        options.appname = Some(service.to_string());

        let config = match init::init_with_options(&options) {
            Ok(c) => c,
            Err(e) => Err(format!("Cannot start controller for {service}: {e}"))?,
        };

        // We're done editing our Config. Wrap it in an Arc.
        let config = config.into_shared();

        let client = match Client::connect(config.clone()) {
            Ok(c) => c,
            Err(e) => Err(format!("Controller cannot connect to bus: {e}"))?,
        };

        let host_settings = match SettingsClient::get_host_settings(&client, false) {
            Ok(s) => s,
            Err(e) => Err(format!("Cannot fetch host setttings: {e}"))?,
        };

        let min_children = host_settings
            .value(&format!("apps/{service}/unix_config/min_children"))
            .as_u64()
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MIN_CHILDREN);

        let max_children = host_settings
            .value(&format!("apps/{service}/unix_config/max_children"))
            .as_u64()
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CHILDREN);

        let max_requests = host_settings
            .value(&format!("apps/{service}/unix_config/max_requests"))
            .as_u32()
            .unwrap_or(DEFAULT_MAX_REQUESTS);

        let keepalive = host_settings
            .value(&format!("apps/{service}/unix_config/keepalive"))
            .as_i32()
            .unwrap_or(DEFAULT_KEEPALIVE);

        let (status_read, status_write) = UnixStream::pair()
            .map_err(|e| format!("Cannot create status socketpair: {e}"))?;

        status_read
            .set_nonblocking(true)
            .map_err(|e| format!("Cannot set status socket non-blocking: {e}"))?;

        let username = client.address().addr().username().to_string();
        let domain = client.address().addr().domain().to_string();
        let service_addr = BusAddress::for_service(&username, &domain, &service)
            .as_str()
            .to_string();

        let mut controller = Controller {
            service,
            config,
            client,
            application,
            methods: None,
            host_settings: host_settings.into_shared(),
            min_children,
            max_children,
            max_requests,
            keepalive,
            service_addr,
            idle_list: Vec::new(),
            active_list: Vec::new(),
            read_status: status_read,
            write_status: status_write,
            stopping: Arc::new(AtomicBool::new(false)),
        };

        controller.listen()
    }

    fn config(&self) -> &Arc<conf::Config> {
        &self.config
    }

    fn host_settings(&self) -> &Arc<HostSettings> {
        &self.host_settings
    }

    fn app(&self) -> &Box<dyn app::Application> {
        &self.application
    }

    fn app_mut(&mut self) -> &mut Box<dyn app::Application> {
        &mut self.application
    }

    fn service(&self) -> &str {
        self.app().name()
    }

    fn client_internal_mut(&self) -> RefMut<ClientSingleton> {
        self.client.singleton().borrow_mut()
    }

    /// List of domains where our service is allowed to run and
    /// therefore whose routers with whom our presence should be registered.
    fn hosting_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for router in self.config().client().routers() {
            match router.services() {
                Some(services) => {
                    if services.iter().any(|s| s.eq(self.service())) {
                        domains.push(router.domain().to_string());
                    }
                }
                None => {
                    // A domain with no specific set of hosted services
                    // hosts all services
                    domains.push(router.domain().to_string());
                }
            }
        }

        domains
    }

    fn register_routers(&mut self) -> Result<(), String> {
        for domain in self.hosting_domains().iter() {
            log::info!("controller: registering with router at {domain}");

            self.client
                .send_router_command(domain, "register", Some(self.service()), false)?;
        }

        Ok(())
    }

    fn unregister_routers(&mut self) -> Result<(), String> {
        for domain in self.hosting_domains().iter() {
            log::info!("controller: un-registering with router at {domain}");

            self.client
                .send_router_command(domain, "unregister", Some(self.service()), false)?;
        }
        Ok(())
    }

    fn setup_signal_handlers(&self) -> Result<(), String> {
        // If any of these signals occur, our self.stopping flag will be set to true
        for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
            if let Err(e) = signal_hook::flag::register(sig, self.stopping.clone()) {
                return Err(format!("Cannot register signal handler: {e}"));
            }
        }

        Ok(())
    }

    fn service_init(&mut self) -> Result<(), String> {
        let client = self.client.clone();
        let config = self.config().clone();
        let host_settings = self.host_settings().clone();
        self.app_mut().init(client, config, host_settings)
    }

    fn register_methods(&mut self) -> Result<(), String> {
        let client = self.client.clone();
        let config = self.config().clone();
        let host_settings = self.host_settings().clone();
        let list = self
            .app_mut()
            .register_methods(client, config, host_settings)?;
        let mut hash: HashMap<String, method::Method> = HashMap::new();
        for m in list {
            hash.insert(m.name().to_string(), m);
        }
        self.add_system_methods(&mut hash);
        self.add_atomic_methods(&mut hash);
        self.methods = Some(Arc::new(hash));
        Ok(())
    }

    fn add_atomic_methods(&self, hash: &mut HashMap<String, method::Method>) {
        let mut atomic_hash: HashMap<String, method::Method> = HashMap::new();

        for method in hash.values() {
            let mut atomic_method = method.clone();
            let name = method.name();
            let atomic_name = format!("{name}.atomic");
            atomic_method.set_atomic(true);
            atomic_method.set_name(&atomic_name);
            atomic_hash.insert(atomic_name, atomic_method);
        }

        hash.extend(atomic_hash);
    }

    fn add_system_methods(&self, hash: &mut HashMap<String, method::Method>) {
        let name = "opensrf.system.echo";
        let mut method = method::Method::new(name, method::ParamCount::Any, system_method_echo);
        method.set_desc("Echo back any values sent");
        hash.insert(name.to_string(), method);

        let name = "opensrf.system.time";
        let mut method = method::Method::new(name, method::ParamCount::Zero, system_method_time);
        method.set_desc("Respond with system time in epoch seconds");
        hash.insert(name.to_string(), method);

        let name = "opensrf.system.introspect";
        let mut method = method::Method::new(
            name,
            method::ParamCount::Range(0, 1),
            system_method_introspect,
        );
        method.set_desc("List published API definitions");
        method.add_param(method::Param {
            required: false,
            name: String::from("Prefix"),
            datatype: method::ParamDataType::String,
            desc: Some(String::from("API name prefix filter")),
        });

        hash.insert(name.to_string(), method);
    }

    pub fn listen(&mut self) -> Result<(), String> {
        self.service_init()?;
        self.register_methods()?;
        self.register_routers()?;
        self.setup_signal_handlers()?;

        self.respawn_to_min();

        loop {
            self.reap_exited();
            self.drain_status_socket();

            if self.stopping.load(Ordering::Relaxed) {
                log::info!("controller: received a stop signal, exiting");
                break;
            }

            self.respawn_to_min();

            let recv_result = self
                .client_internal_mut()
                .bus_mut()
                .recv(IDLE_WAKE_TIME, Some(&self.service_addr));

            let tmsg = match recv_result {
                Ok(Some(t)) => t,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("controller: error reading from bus: {e}");
                    continue;
                }
            };

            if let Err(e) = self.dispatch(tmsg) {
                log::error!("controller: {e}");
            }
        }

        self.unregister_routers()?;
        self.shutdown();

        Ok(())
    }

    /// Pick an idle child (spawning one if room permits, or blocking
    /// for one to free up if we're already at max_children) and
    /// forward the dispatched request's wire form over its data
    /// socket.
    fn dispatch(&mut self, tmsg: message::TransportMessage) -> Result<(), String> {
        let mut child = if let Some(c) = self.idle_list.pop() {
            c
        } else if self.active_list.len() < self.max_children {
            self.spawn_child()?
        } else {
            log::warn!(
                "controller: reached max children ({}); waiting for one to free up",
                self.max_children
            );
            self.wait_for_idle_child()?
        };

        let xml = tmsg.to_xml();
        let frame = format!("{}{}", util::format_size_pad(xml.len()), xml);

        if let Err(e) = child.stream.write_all(frame.as_bytes()) {
            let pid = child.pid;
            log::error!("controller: failed dispatching to child {pid}: {e}; killing it");
            self.kill_child(&child);
            return Err(format!("dispatch write to child {pid} failed: {e}"));
        }

        self.active_list.push(child);

        Ok(())
    }

    /// Blocks, polling our bookkeeping, until a child reports idle or
    /// we're told to stop.
    fn wait_for_idle_child(&mut self) -> Result<Child, String> {
        loop {
            if self.stopping.load(Ordering::Relaxed) {
                return Err("controller is stopping; dropping request".to_string());
            }

            self.reap_exited();
            self.drain_status_socket();

            if let Some(c) = self.idle_list.pop() {
                return Ok(c);
            }

            thread::sleep(Duration::from_millis(100));
        }
    }

    fn respawn_to_min(&mut self) {
        if self.stopping.load(Ordering::Relaxed) {
            return;
        }

        while self.idle_list.len() + self.active_list.len() < self.min_children {
            match self.spawn_child() {
                Ok(child) => self.idle_list.push(child),
                Err(e) => {
                    log::error!("controller: failed to spawn child: {e}");
                    // Avoid a tight fork retry loop if something about
                    // our environment is broken.
                    thread::sleep(Duration::from_secs(1));
                    break;
                }
            }
        }
    }

    /// Forks a new worker child.
    ///
    /// The child never returns from this call -- it runs its full
    /// request loop and calls process::exit() when done.
    fn spawn_child(&mut self) -> Result<Child, String> {
        let (parent_end, child_end) =
            UnixStream::pair().map_err(|e| format!("UnixStream::pair() failed: {e}"))?;

        let status_stream = self
            .write_status
            .try_clone()
            .map_err(|e| format!("could not clone status stream: {e}"))?;

        let pid = unsafe { libc::fork() };

        if pid < 0 {
            return Err(format!(
                "fork() failed: {}",
                std::io::Error::last_os_error()
            ));
        }

        if pid == 0 {
            // We are now an independent child process.  parent_end is
            // of no use to us; our copy of the original process's
            // bus/redis connection is not safe to reuse post-fork
            // either, which is why Worker::new() opens its own.
            drop(parent_end);
            self.run_child(child_end, status_stream);
            std::process::exit(0);
        }

        drop(child_end);

        log::debug!("controller: spawned child pid={pid}");

        Ok(Child {
            pid,
            stream: parent_end,
        })
    }

    /// Runs in the freshly-forked child.  Never returns to the caller.
    fn run_child(&mut self, data_stream: UnixStream, status_stream: UnixStream) {
        let factory = self.application.worker_factory();
        let env = self.application.env();

        let mut worker = match Worker::new(
            self.service.clone(),
            self.config.clone(),
            self.host_settings.clone(),
            self.stopping.clone(),
            self.methods.as_ref().unwrap().clone(),
            data_stream,
            status_stream,
            self.keepalive,
        ) {
            Ok(w) => w,
            Err(e) => {
                log::error!(
                    "controller: child {} cannot create worker: {e}",
                    std::process::id()
                );
                return;
            }
        };

        match worker.create_app_worker(factory, env) {
            Ok(w) => worker.listen(w, self.max_requests),
            Err(e) => {
                log::error!(
                    "controller: child {} cannot create app worker: {e}",
                    std::process::id()
                );
            }
        }
    }

    /// Reaps any children that have exited and removes them from our
    /// bookkeeping.  Non-blocking.
    fn reap_exited(&mut self) {
        loop {
            let mut status: i32 = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };

            if pid <= 0 {
                break;
            }

            log::debug!("controller: reaped exited child pid={pid}");

            self.idle_list.retain(|c| c.pid != pid);
            self.active_list.retain(|c| c.pid != pid);
        }
    }

    /// Non-blocking drain of every pending pid report on the status
    /// socket, moving each reporting child from active to idle.
    fn drain_status_socket(&mut self) {
        loop {
            let mut buf = [0u8; util::SIZE_PAD];

            match self.read_status.read(&mut buf) {
                Ok(0) => break,
                Ok(n) if n == util::SIZE_PAD => match std::str::from_utf8(&buf) {
                    Ok(s) => match s.trim().parse::<libc::pid_t>() {
                        Ok(pid) => self.mark_idle(pid),
                        Err(_) => log::warn!("controller: unparseable status report: {s}"),
                    },
                    Err(_) => log::warn!("controller: non-UTF8 status report"),
                },
                Ok(_) => {
                    log::warn!("controller: short read on status socket");
                    break;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("controller: error reading status socket: {e}");
                    break;
                }
            }
        }
    }

    fn mark_idle(&mut self, pid: libc::pid_t) {
        if let Some(pos) = self.active_list.iter().position(|c| c.pid == pid) {
            let child = self.active_list.remove(pos);
            self.idle_list.push(child);
        } else {
            log::trace!("controller: idle report from unknown/already-idle child {pid}");
        }
    }

    fn kill_child(&mut self, child: &Child) {
        unsafe {
            libc::kill(child.pid, libc::SIGKILL);
            let mut status: i32 = 0;
            libc::waitpid(child.pid, &mut status, 0);
        }
    }

    fn shutdown(&mut self) {
        let timer = util::Timer::new(SHUTDOWN_MAX_WAIT);

        while !timer.done() && !self.active_list.is_empty() {
            let info = format!(
                "{} shutdown: {} active children; time remaining {}",
                self.service(),
                self.active_list.len(),
                timer.remaining(),
            );

            // Nod to anyone control-C'ing from the command line.
            println!("{info}...");
            log::info!("{info}");

            thread::sleep(Duration::from_secs(1));

            self.reap_exited();
            self.drain_status_socket();
        }

        // Ask anyone still alive to leave, then force anyone who
        // didn't take the hint.
        for child in self.idle_list.iter().chain(self.active_list.iter()) {
            unsafe {
                libc::kill(child.pid, libc::SIGTERM);
            }
        }

        thread::sleep(Duration::from_millis(200));
        self.reap_exited();

        for child in self.idle_list.iter().chain(self.active_list.iter()) {
            unsafe {
                libc::kill(child.pid, libc::SIGKILL);
            }
        }

        self.reap_exited();

        std::process::exit(0);
    }
}

// Toss our system method handlers down here.
fn system_method_echo(
    _worker: &mut Box<dyn app::ApplicationWorker>,
    session: &mut session::ServerSession,
    method: &message::Method,
) -> Result<(), String> {
    for p in method.params() {
        session.respond(p.clone())?;
    }
    Ok(())
}

fn system_method_time(
    _worker: &mut Box<dyn app::ApplicationWorker>,
    session: &mut session::ServerSession,
    _method: &message::Method,
) -> Result<(), String> {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(t) => session.respond(t.as_secs()),
        Err(e) => Err(format!("System time error: {e}")),
    }
}

fn system_method_introspect(
    worker: &mut Box<dyn app::ApplicationWorker>,
    session: &mut session::ServerSession,
    method: &message::Method,
) -> Result<(), String> {
    // If a prefix string is provided, only return methods whose name
    // starts with the provided prefix.
    if let Some(prefix) = method.params().get(0) {
        if let Some(prefix) = prefix.as_str() {
            for meth in worker
                .methods()
                .values()
                .filter(|m| m.name().starts_with(prefix))
            {
                session.respond(meth.to_json_value())?;
            }
            return Ok(());
        }
    }

    for meth in worker.methods().values() {
        session.respond(meth.to_json_value())?;
    }

    Ok(())
}
