use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "doozer-ctl", about = "Control socket client")]
struct Args {
    /// Path to the control socket
    #[arg(short = 's', long, default_value = "/var/run/doozer.sock")]
    socket: String,

    /// Command verb and its arguments
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let stream = UnixStream::connect(&args.socket).await?;
    let (rd, mut wr) = stream.into_split();

    wr.write_all(format!("{}\n", args.command.join(" ")).as_bytes())
        .await?;
    wr.shutdown().await?;

    let mut lines = BufReader::new(rd).lines();
    let mut status = 1i32;

    while let Some(line) = lines.next_line().await? {
        if let Some(msg) = line.strip_prefix(':') {
            println!("{}", msg);
        } else {
            status = line.trim().parse().unwrap_or(1);
            break;
        }
    }

    std::process::exit(status);
}
