#![allow(clippy::cognitive_complexity)]
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use nats_client::{ClientEvent, MsgOp, NatsClient, Op};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::*;

mod config;

use config::{
    cli::{self, Command, Parser},
    trace,
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    let dotenv_result = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.nats_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv_result {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start client"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let client = NatsClient::new(config.connection_info()?)?;
    info!(client_id = client.id(), urls = %config.nats_urls, "starting client");

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));
    let events = spawn_event_logger(&client);

    let result = match client.connect_with_token(&token).await {
        Ok(()) => run(&client, &config, &token).await,
        Err(err) => Err(anyhow!(err).context("failed to connect")),
    };

    if let Err(err) = client.dispose().await {
        warn!(?err, "errors while disposing client");
    }
    if let Err(err) = events.await {
        error!(?err, "error waiting for event logger");
    }
    result
}

async fn run(client: &NatsClient, config: &cli::Config, token: &CancellationToken) -> Result<()> {
    match &config.command {
        Command::Pub {
            subject,
            payload,
            reply,
            headers,
            count,
        } => {
            let headers = cli::parse_headers(headers)?;
            for _ in 0..*count {
                match (&headers, reply) {
                    (Some(headers), reply) => {
                        client
                            .publish_with_headers(subject, reply.as_deref(), headers, payload)
                            .await?
                    }
                    (None, Some(reply)) => client.publish_with_reply(subject, reply, payload).await?,
                    (None, None) => client.publish(subject, payload).await?,
                }
            }
            client.flush().await?;
            info!(%subject, count, "published");
        }
        Command::Sub { subject, queue, max } => {
            let info = cli::subscription(subject, queue.as_deref(), *max)?;
            let mut sub = client.subscribe_with_info(info).await?;
            info!(%subject, "listening");
            let mut received = 0u64;
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => break,
                    msg = sub.next() => msg,
                };
                let Some(msg) = msg else {
                    debug!("subscription ended");
                    break;
                };
                received += 1;
                print_msg(received, &msg);
            }
            info!(received, "done");
        }
        Command::Request { subject, payload } => {
            let start = Instant::now();
            let reply = client
                .request_with_token(subject, payload, token)
                .await
                .with_context(|| format!("request to '{subject}' failed"))?;
            info!(elapsed = ?start.elapsed(), "received reply");
            print_msg(1, &reply);
        }
        Command::Reply {
            subject,
            response,
            queue,
        } => {
            let info = cli::subscription(subject, queue.as_deref(), None)?;
            let mut sub = client.subscribe_with_info(info).await?;
            info!(%subject, "answering requests");
            let mut answered = 0u64;
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => break,
                    msg = sub.next() => msg,
                };
                let Some(msg) = msg else {
                    break;
                };
                let Some(reply_to) = msg.reply_to.as_deref() else {
                    debug!(subject = %msg.subject, "message without reply subject, ignoring");
                    continue;
                };
                match client.publish(reply_to, response).await {
                    Ok(()) => answered += 1,
                    Err(err) if err.is_not_connected() => {
                        warn!(?err, "not connected, request dropped")
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            info!(answered, "done");
        }
        Command::Ping { count } => {
            let mut ops = client.ops();
            for n in 1..=*count {
                let start = Instant::now();
                client.ping().await?;
                let wait_pong = async {
                    loop {
                        match ops.next().await {
                            Some(Op::Pong) => return Ok(()),
                            Some(_) => continue,
                            None => bail!("client closed"),
                        }
                    }
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = tokio::time::timeout(config.request_timeout(), wait_pong) => {
                        res.context("timed out waiting for PONG")??;
                    }
                }
                println!("PONG #{n} in {:?}", start.elapsed());
            }
        }
    }
    Ok(())
}

fn print_msg(n: u64, msg: &MsgOp) {
    let reply = msg
        .reply_to
        .as_deref()
        .map(|reply| format!(" (reply: {reply})"))
        .unwrap_or_default();
    println!("[#{n}] {}{reply}", msg.subject);
    if let Some(headers) = &msg.headers {
        for (key, values) in headers.iter() {
            for value in values {
                println!("{key}: {value}");
            }
        }
    }
    println!("{}", String::from_utf8_lossy(&msg.payload));
}

fn spawn_event_logger(client: &NatsClient) -> JoinHandle<()> {
    let mut events = client.events();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                ClientEvent::Connected { host } => info!(%host, "connected"),
                ClientEvent::Disconnected { reason } => info!(?reason, "disconnected"),
                ClientEvent::WorkerFailed { error } => warn!(?error, "connection failed"),
                ClientEvent::AutoReconnectFailed { attempts } => {
                    error!(attempts, "gave up reconnecting")
                }
            }
        }
    })
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
