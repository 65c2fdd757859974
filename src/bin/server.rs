//! httpool 示例服务器。
//!
//! 从 JSON 清单构建并运行一组 HTTP 服务器，直到收到 SIGINT/SIGTERM。
//!
//! ```bash
//! httpool-server --manifest-example > manifest.json
//! httpool-server --log debug --threads 4 manifest.json
//! ```

use std::error::Error as StdError;
use std::str::FromStr;

use httpool::rt::Executor;
use httpool::server::{ServerBuilder, EXAMPLE_MANIFEST};
use tracing::Level;

const VERSION_INFO: &str = concat!(
    "httpool Server App\n",
    "==================\n",
    "A simple HTTP server based on the httpool library.\n",
    "\n",
    "Version: ",
    env!("CARGO_PKG_VERSION"),
);

const HELP_INFO: &str = "\
Usage: httpool-server [options] [manifest]

Options:
  -v, --version           print version info
  -h, --help              print help info
  -l, --log <level>       log level (trace|debug|info|warn|error)
  -t, --threads <n>       number of worker threads
      --manifest-example  print example of service manifest file
      --manifest <path>   path to service manifest file";

fn main() {
    // 任何跑到 main 的未知 unwind 都以 -1 退出
    let code = match std::panic::catch_unwind(run) {
        Ok(code) => code,
        Err(_) => {
            eprintln!("UNKNOWN PANIC");
            -1
        }
    };
    std::process::exit(code);
}

fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        println!("{HELP_INFO}");
        return 0;
    }

    let mut log_level = Level::INFO;
    let mut threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut manifest: Option<String> = None;

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--help" | "-h" => {
                println!("{HELP_INFO}");
                return 0;
            }
            "--version" | "-v" => {
                println!("{VERSION_INFO}");
                return 0;
            }
            "--manifest-example" => {
                println!("{EXAMPLE_MANIFEST}");
                return 0;
            }
            "--log" | "-l" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("missing value for {arg}");
                    return 1;
                };
                log_level = match Level::from_str(value) {
                    Ok(level) => level,
                    Err(_) => {
                        eprintln!("invalid log level: {value}");
                        return 1;
                    }
                };
                i += 1;
            }
            "--threads" | "-t" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("missing value for {arg}");
                    return 1;
                };
                threads = match value.parse() {
                    Ok(n) if n > 0 => n,
                    _ => {
                        eprintln!("invalid thread count: {value}");
                        return 1;
                    }
                };
                i += 1;
            }
            "--manifest" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("missing value for {arg}");
                    return 1;
                };
                manifest = Some(value.clone());
                i += 1;
            }
            // 位置参数同样当作清单路径
            _ if !arg.starts_with('-') && manifest.is_none() => {
                manifest = Some(arg.to_string());
            }
            _ => {
                eprintln!("unknown argument: {arg}");
                return 1;
            }
        }
        i += 1;
    }

    tracing_subscriber::fmt().with_max_level(log_level).init();

    match serve(manifest.as_deref().unwrap_or(""), threads) {
        Ok(()) => 0,
        Err(e) => match e.downcast_ref::<httpool::Error>() {
            Some(_domain) => {
                eprintln!("{e:?}");
                -3
            }
            None => {
                eprintln!("Error: {e}");
                -2
            }
        },
    }
}

fn serve(manifest: &str, threads: usize) -> Result<(), Box<dyn StdError>> {
    let ex = Executor::new(threads);
    ex.start();

    let mut sb = ServerBuilder::new();
    sb.register_builtins();
    let servers = sb.build_json_file(manifest)?;
    ServerBuilder::start_all(&ex, &servers);

    wait_for_signal(&ex)?;

    ServerBuilder::stop_all(&servers);
    ex.wait();
    Ok(())
}

/// 阻塞等待 SIGINT / SIGTERM。
fn wait_for_signal(ex: &Executor) -> std::io::Result<()> {
    ex.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate())?;
            tokio::select! {
                r = tokio::signal::ctrl_c() => r,
                _ = term.recv() => Ok(()),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await
        }
    })
}
