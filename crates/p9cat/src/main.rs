use {
    clap::Parser,
    log::{debug, info},
    rs9p_client::{Config, DEFAULT_MSIZE, Fsys, dial, om},
    std::time::Duration,
    tokio::io::{AsyncWriteExt, Stdout},
};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Files to print, relative to the attached tree
    #[arg(required = true)]
    paths: Vec<String>,

    /// Maximum message size to offer the server
    #[arg(long, default_value_t = DEFAULT_MSIZE)]
    msize: u32,

    /// User name sent in Tattach
    #[arg(long, default_value = "nobody")]
    user: String,

    /// File tree to attach to
    #[arg(long, default_value = "")]
    aname: String,

    /// Per-request deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl Cli {
    fn config(&self) -> Config {
        let config = Config::default().msize(self.msize);
        match self.timeout_ms {
            Some(ms) => config.timeout(Duration::from_millis(ms)),
            None => config,
        }
    }
}

async fn cat(fsys: &Fsys, path: &str, out: &mut Stdout) -> rs9p_client::Result<()> {
    let fid = fsys.open(path, om::READ).await?;
    let mut buf = vec![0; fid.conn().msize() as usize];
    let copied = loop {
        let n = match fid.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = out.write_all(&buf[..n]).await {
            break Err(e.into());
        }
    };

    let closed = fid.close().await;
    copied.and(closed)
}

async fn p9cat_main(cli: Cli) -> rs9p_client::Result<i32> {
    let conn = dial(&cli.address, cli.config()).await?;
    info!("connected to {} (msize {})", cli.address, conn.msize());
    let fsys = conn.attach(&cli.user, &cli.aname).await?;

    let mut out = tokio::io::stdout();
    let mut exit_code = 0;
    for path in &cli.paths {
        debug!("reading {}", path);
        if let Err(e) = cat(&fsys, path, &mut out).await {
            eprintln!("p9cat: {}: {}", path, e);
            exit_code = 1;
            if e.is_fatal() {
                break;
            }
        }
    }
    out.flush().await?;

    if !conn.is_closed() {
        fsys.close().await?;
    }
    conn.close().await;
    Ok(exit_code)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = p9cat_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}
