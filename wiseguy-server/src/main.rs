//! Runnable preforking server: a supervisor hosting a demo application
//! behind HTTP or FastCGI workers, with an optional fd registry for
//! zero-downtime restarts and an embedded admin endpoint.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Error};

use wiseguy_daemon::{Application, BindAddress, Environ, ManagedServer, Response, ServerConfig};
use wiseguy_fcgi_server::PreForkingFcgiServer;
use wiseguy_fd_server::FdServer;
use wiseguy_http_server::{AdminResponse, AdminServer, PreForkingHttpServer, SERVER_SOFTWARE};

struct Options {
    bind: BindAddress,
    fcgi: bool,
    workers: usize,
    fd_server: Option<PathBuf>,
    admin: Option<BindAddress>,
    max_requests: Option<u64>,
    max_lifetime: Option<Duration>,
    keepalive: Duration,
}

const USAGE: &str = "\
usage: wiseguy-server [options]
  --bind <host:port|/path>    listening address (default 127.0.0.1:8080)
  --fcgi                      serve FastCGI instead of HTTP
  --workers <n>               worker process count (default 4)
  --fd-server <path>          unix socket of the fd registry
  --admin <host:port>         embedded admin endpoint
  --max-requests <n>          requests served per worker before restart
  --max-lifetime <seconds>    worker lifetime before restart
  --keepalive <seconds>       keep-alive idle timeout (default 5)
";

impl Options {
    fn parse(mut args: std::env::Args) -> Result<Options, Error> {
        let mut options = Options {
            bind: "127.0.0.1:8080".parse()?,
            fcgi: false,
            workers: 4,
            fd_server: None,
            admin: None,
            max_requests: None,
            max_lifetime: None,
            keepalive: Duration::from_secs(5),
        };
        args.next(); // program name
        while let Some(arg) = args.next() {
            let mut value = |name: &str| {
                args.next()
                    .ok_or_else(|| anyhow::format_err!("{name} needs a value\n{USAGE}"))
            };
            match arg.as_str() {
                "--bind" => options.bind = value("--bind")?.parse()?,
                "--fcgi" => options.fcgi = true,
                "--workers" => options.workers = value("--workers")?.parse()?,
                "--fd-server" => options.fd_server = Some(PathBuf::from(value("--fd-server")?)),
                "--admin" => options.admin = Some(value("--admin")?.parse()?),
                "--max-requests" => options.max_requests = Some(value("--max-requests")?.parse()?),
                "--max-lifetime" => {
                    options.max_lifetime = Some(Duration::from_secs(value("--max-lifetime")?.parse()?))
                }
                "--keepalive" => {
                    options.keepalive = Duration::from_secs_f64(value("--keepalive")?.parse()?)
                }
                "--help" | "-h" => bail!("{USAGE}"),
                other => bail!("unknown option {other:?}\n{USAGE}"),
            }
        }
        Ok(options)
    }
}

fn demo_app(environ: &Environ, body: &mut dyn Read) -> Result<Response, Error> {
    let method = environ
        .get("REQUEST_METHOD")
        .map_or("-", String::as_str)
        .to_string();
    let path = environ.get("PATH_INFO").map_or("-", String::as_str).to_string();
    let mut consumed = 0usize;
    if method == "POST" {
        let mut buf = [0u8; 8192];
        loop {
            let n = body.read(&mut buf)?;
            if n == 0 {
                break;
            }
            consumed += n;
        }
    }
    Ok(Response::text(
        200,
        format!(
            "{SERVER_SOFTWARE} pid={} {method} {path} body_bytes={consumed}\n",
            std::process::id()
        ),
    ))
}

fn run() -> Result<(), Error> {
    let options = Options::parse(std::env::args())?;

    let mut config = ServerConfig::new(options.bind.clone());
    config.num_workers = options.workers;
    config.keepalive_timeout = options.keepalive;
    config.max_requests_per_worker = options.max_requests;
    config.max_worker_lifetime = options.max_lifetime;

    let mut server = ManagedServer::new(config);
    if let Some(path) = &options.fd_server {
        let fd_server = FdServer::bind(path)
            .with_context(|| format!("failed to start fd server on {}", path.display()))?;
        server.set_fd_server(fd_server);
    }

    let mut admin = match &options.admin {
        Some(address) => {
            let mut admin = AdminServer::bind(address)?;
            let status_bind = options.bind.canonical();
            let status_workers = options.workers;
            admin.register_handler("/status", move |_req| {
                Ok(AdminResponse::text(format!(
                    "pid: {}\nbind: {status_bind}\nworkers: {status_workers}\n",
                    std::process::id()
                )))
            });
            admin.start()?;
            log::info!("admin server on {}", admin.local_addr());
            if let Some(fd_server) = server.fd_server() {
                fd_server.set_micro_management_address(&admin.local_addr().to_string());
            }
            Some(admin)
        }
        None => None,
    };

    let app: Arc<dyn Application> = Arc::new(demo_app);
    if options.fcgi {
        PreForkingFcgiServer::with_server(server, app).run()?;
    } else {
        PreForkingHttpServer::with_server(server, app).run()?;
    }

    if let Some(admin) = admin.as_mut() {
        admin.stop();
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
