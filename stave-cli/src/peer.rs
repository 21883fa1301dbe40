//! Client-side commands: `stave send` and `stave listen`.

use std::sync::mpsc;

use anyhow::{Context as _, Result, bail};
use stave::{Client, Context, Listener};
use stave_proto::{PROTOCOL_VERSION, Response};

use crate::GlobalOpts;

/// Arguments for `stave send`.
///
/// Usage: `stave send [OPTIONS] NAME [ARG...]`
#[derive(clap::Args)]
pub(crate) struct SendArgs {
    /// Skip the version handshake.
    #[arg(long)]
    pub no_handshake: bool,

    /// Function name.
    pub name: String,

    /// String arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Arguments for `stave listen`.
#[derive(clap::Args)]
pub(crate) struct ListenArgs {
    /// Exit after this many broadcasts.
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}

fn connect(ctx: &Context, opts: &GlobalOpts, name: &str) -> Result<Client> {
    let logger = opts.logger(name)?;
    Client::builder(ctx, &opts.interactive, &opts.broadcast)
        .encryption(opts.encryption(&logger))
        .logger(logger)
        .connect()
        .with_context(|| format!("failed to connect to {}", opts.interactive))
}

pub(crate) fn send(opts: &GlobalOpts, args: &SendArgs) -> Result<()> {
    let ctx = Context::new();
    let client = connect(&ctx, opts, "client")?;
    let result = exchange(&client, args);
    client.stop()?;

    let resp = result?;
    println!("{}", resp.encode());
    if resp.is_fail() {
        bail!("{} failed", args.name);
    }
    Ok(())
}

fn exchange(client: &Client, args: &SendArgs) -> Result<Response> {
    if !args.no_handshake {
        client
            .handshake(PROTOCOL_VERSION)
            .context("handshake failed")?;
    }
    Ok(client.call(&args.name, &args.args)?)
}

pub(crate) fn listen(opts: &GlobalOpts, args: &ListenArgs) -> Result<()> {
    let ctx = Context::new();
    let client = connect(&ctx, opts, "listener")?;

    let (tx, rx) = mpsc::channel();
    let mut listener = Listener::new(move |_: &Client, msg: String| {
        println!("{msg}");
        let _ = tx.send(());
        Ok(())
    });
    if let Some(timeout) = opts.poll_timeout() {
        listener = listener.poll_timeout(timeout);
    }
    client.start_background(listener)?;

    match args.count {
        Some(n) => {
            for _ in 0..n {
                if rx.recv().is_err() {
                    break;
                }
            }
        }
        None => crate::wait_for_shutdown()?,
    }
    client.stop()?;
    Ok(())
}
