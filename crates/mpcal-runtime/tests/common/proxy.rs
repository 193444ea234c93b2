//! The proxy system: a proxy forwards client requests to the lowest-id
//! live server, falling back to the next server when the failure detector
//! flags the current one and answering `FAIL` when no server is live.
//!
//! Node identifiers: servers `1..=NUM_SERVERS`, clients
//! `NUM_SERVERS+1..=NUM_SERVERS+NUM_CLIENTS`, then the proxy. Mailboxes
//! are indexed by `<<node, message_type>>`.

use async_trait::async_trait;
use mpcal_runtime::context::{Archetype, ArchetypeContext, Constants, ContextHandle};
use mpcal_runtime::error::Result;
use mpcal_runtime::resource::ResourceMaker;
use mpcal_runtime::resources::{
    FailureDetector, FailureDetectorConfig, InputChannel, LocalRegister, MailboxConfig,
    MailboxKind, OutputChannel, PlaceHolder, TcpMailboxes,
};
use mpcal_tla::Value;
use tokio::sync::mpsc;

/// Client request to the proxy.
pub const REQ_MSG_TYP: i64 = 1;
/// Proxy response to a client.
pub const RESP_MSG_TYP: i64 = 2;
/// Proxy-forwarded request to a server.
pub const PROXY_REQ_MSG_TYP: i64 = 3;
/// Server response to the proxy.
pub const PROXY_RESP_MSG_TYP: i64 = 4;

const NUM_MSG_TYPES: i64 = 4;

/// Mailbox index `<<node, message_type>>`.
pub fn mailbox_index(node: i64, msg_type: i64) -> Value {
    Value::tuple([Value::number(node), Value::number(msg_type)])
}

/// The constants every node of the proxy system binds.
pub fn proxy_constants(num_servers: i64, num_clients: i64) -> Constants {
    Constants::new([
        ("NUM_SERVERS", Value::number(num_servers)),
        ("NUM_CLIENTS", Value::number(num_clients)),
        ("FAIL", Value::number(100)),
        ("CLIENT_RUN", Value::bool(true)),
    ])
}

fn proxy_id(ctx: &ArchetypeContext) -> Result<i64> {
    let num_servers = ctx.constant("NUM_SERVERS")?.as_number()?;
    let num_clients = ctx.constant("NUM_CLIENTS")?.as_number()?;
    Ok(num_servers + num_clients + 1)
}

/// Mailbox network maker: one deterministic port per `<<node, type>>`
/// pair, local for this node's own inboxes.
pub fn network_maker(self_id: i64, base_port: u16, config: MailboxConfig) -> ResourceMaker {
    TcpMailboxes::maker(
        move |index| {
            let parts = index.as_tuple().expect("mailbox index must be a tuple");
            let node = parts[0].as_number().expect("node id");
            let msg_type = parts[1].as_number().expect("message type");
            let offset = (node - 1) * NUM_MSG_TYPES + (msg_type - 1);
            let port = base_port + u16::try_from(offset).expect("port offset");
            let kind = if node == self_id {
                MailboxKind::Local
            } else {
                MailboxKind::Remote
            };
            (kind, format!("127.0.0.1:{port}"))
        },
        config,
    )
}

// ---------------------------------------------------------------------
// AProxy
// ---------------------------------------------------------------------

/// The proxy archetype.
pub struct AProxy;

#[async_trait]
impl Archetype for AProxy {
    fn name(&self) -> &'static str {
        "AProxy"
    }

    fn entry_label(&self) -> &'static str {
        "proxyLoop"
    }

    async fn section(&self, label: &str, ctx: &mut ArchetypeContext) -> Result<()> {
        match label {
            "proxyLoop" => {
                let me = ctx.self_id().as_number()?;
                let msg = ctx.read("net", &[mailbox_index(me, REQ_MSG_TYP)]).await?;
                ctx.write("msg", &[], msg).await?;
                ctx.write("idx", &[], Value::number(1)).await?;
                ctx.goto("serversLoop").await
            },
            "serversLoop" => {
                let idx = ctx.read("idx", &[]).await?.as_number()?;
                let num_servers = ctx.constant("NUM_SERVERS")?.as_number()?;
                if idx > num_servers {
                    ctx.write("srv", &[], Value::number(0)).await?;
                    ctx.goto("sendResp").await
                } else {
                    let suspected = ctx.read("fd", &[Value::number(idx)]).await?.as_bool()?;
                    if suspected {
                        ctx.write("idx", &[], Value::number(idx + 1)).await?;
                        ctx.goto("serversLoop").await
                    } else {
                        ctx.write("srv", &[], Value::number(idx)).await?;
                        ctx.goto("proxySend").await
                    }
                }
            },
            "proxySend" => {
                let srv = ctx.read("srv", &[]).await?.as_number()?;
                // Re-checked on every retry: a server that dies between
                // sections (or mid-retry) is skipped instead of spun on.
                let suspected = ctx.read("fd", &[Value::number(srv)]).await?.as_bool()?;
                if suspected {
                    ctx.write("idx", &[], Value::number(srv + 1)).await?;
                    ctx.goto("serversLoop").await
                } else {
                    let msg = ctx.read("msg", &[]).await?;
                    let request = Value::record([
                        ("from", ctx.self_id().clone()),
                        ("body", msg.dot("body")?),
                    ]);
                    ctx.write("net", &[mailbox_index(srv, PROXY_REQ_MSG_TYP)], request)
                        .await?;
                    ctx.goto("proxyRcv").await
                }
            },
            "proxyRcv" => {
                let srv = ctx.read("srv", &[]).await?.as_number()?;
                let suspected = ctx.read("fd", &[Value::number(srv)]).await?.as_bool()?;
                if suspected {
                    ctx.write("idx", &[], Value::number(srv + 1)).await?;
                    ctx.goto("serversLoop").await
                } else {
                    let me = ctx.self_id().as_number()?;
                    let pmsg = ctx
                        .read("net", &[mailbox_index(me, PROXY_RESP_MSG_TYP)])
                        .await?;
                    ctx.write("resp", &[], pmsg.dot("body")?).await?;
                    ctx.goto("sendResp").await
                }
            },
            "sendResp" => {
                let srv = ctx.read("srv", &[]).await?.as_number()?;
                let body = if srv == 0 {
                    ctx.constant("FAIL")?
                } else {
                    ctx.read("resp", &[]).await?
                };
                let msg = ctx.read("msg", &[]).await?;
                let client = msg.dot("from")?.as_number()?;
                let response =
                    Value::record([("from", ctx.self_id().clone()), ("body", body)]);
                ctx.write("net", &[mailbox_index(client, RESP_MSG_TYP)], response)
                    .await?;
                ctx.goto("proxyLoop").await
            },
            other => unreachable!("AProxy has no label {other}"),
        }
    }
}

/// Deployment wiring for a proxy node.
pub fn proxy_ctx(
    self_id: i64,
    base_port: u16,
    monitor_addr: String,
    constants: &Constants,
) -> (ArchetypeContext, ContextHandle) {
    ArchetypeContext::builder(Value::number(self_id), AProxy)
        .constants(constants)
        .resource(
            "net",
            network_maker(self_id, base_port, MailboxConfig::default()),
        )
        .resource(
            "fd",
            FailureDetector::maker(
                move |_index| monitor_addr.clone(),
                FailureDetectorConfig {
                    pull_interval: std::time::Duration::from_millis(200),
                    timeout: std::time::Duration::from_millis(500),
                },
            ),
        )
        .resource("msg", LocalRegister::maker(Value::number(0)))
        .resource("idx", LocalRegister::maker(Value::number(0)))
        .resource("srv", LocalRegister::maker(Value::number(0)))
        .resource("resp", LocalRegister::maker(Value::number(0)))
        .finish()
}

// ---------------------------------------------------------------------
// AServer
// ---------------------------------------------------------------------

/// The server archetype: answers proxy-forwarded requests with its own
/// identity as the body.
pub struct AServer;

#[async_trait]
impl Archetype for AServer {
    fn name(&self) -> &'static str {
        "AServer"
    }

    fn entry_label(&self) -> &'static str {
        "serverLoop"
    }

    async fn section(&self, label: &str, ctx: &mut ArchetypeContext) -> Result<()> {
        match label {
            "serverLoop" => {
                let me = ctx.self_id().as_number()?;
                let msg = ctx
                    .read("net", &[mailbox_index(me, PROXY_REQ_MSG_TYP)])
                    .await?;
                ctx.write("m", &[], msg).await?;
                ctx.goto("serverSend").await
            },
            "serverSend" => {
                let msg = ctx.read("m", &[]).await?;
                let to = msg.dot("from")?.as_number()?;
                let response = Value::record([
                    ("from", ctx.self_id().clone()),
                    ("body", ctx.self_id().clone()),
                ]);
                ctx.write("net", &[mailbox_index(to, PROXY_RESP_MSG_TYP)], response)
                    .await?;
                ctx.goto("serverLoop").await
            },
            other => unreachable!("AServer has no label {other}"),
        }
    }
}

/// Deployment wiring for a server node. The failure-detector and
/// network-toggle parameters are declared by the archetype but unused in
/// this deployment, so they bind to placeholders.
pub fn server_ctx(
    self_id: i64,
    base_port: u16,
    constants: &Constants,
) -> (ArchetypeContext, ContextHandle) {
    ArchetypeContext::builder(Value::number(self_id), AServer)
        .constants(constants)
        .resource(
            "net",
            network_maker(self_id, base_port, MailboxConfig::default()),
        )
        .resource("fd", PlaceHolder::maker())
        .resource("netEnabled", PlaceHolder::maker())
        .resource("m", LocalRegister::maker(Value::number(0)))
        .finish()
}

// ---------------------------------------------------------------------
// AClient
// ---------------------------------------------------------------------

/// The client archetype: relays host input to the proxy and proxy
/// responses back to the host.
pub struct AClient;

#[async_trait]
impl Archetype for AClient {
    fn name(&self) -> &'static str {
        "AClient"
    }

    fn entry_label(&self) -> &'static str {
        "clientLoop"
    }

    async fn section(&self, label: &str, ctx: &mut ArchetypeContext) -> Result<()> {
        match label {
            "clientLoop" => {
                if !ctx.constant("CLIENT_RUN")?.as_bool()? {
                    return ctx.done().await;
                }
                let request = ctx.read("input", &[]).await?;
                ctx.write("req", &[], request).await?;
                ctx.goto("clientSend").await
            },
            "clientSend" => {
                let request = ctx.read("req", &[]).await?;
                let proxy = proxy_id(ctx)?;
                let message = Value::record([
                    ("from", ctx.self_id().clone()),
                    ("body", request),
                ]);
                ctx.write("net", &[mailbox_index(proxy, REQ_MSG_TYP)], message)
                    .await?;
                ctx.goto("clientRcv").await
            },
            "clientRcv" => {
                let me = ctx.self_id().as_number()?;
                let response = ctx.read("net", &[mailbox_index(me, RESP_MSG_TYP)]).await?;
                ctx.write("output", &[], response).await?;
                ctx.goto("clientLoop").await
            },
            other => unreachable!("AClient has no label {other}"),
        }
    }
}

/// Deployment wiring for a client node.
pub fn client_ctx(
    self_id: i64,
    base_port: u16,
    input: mpsc::Receiver<Value>,
    output: mpsc::Sender<Value>,
    constants: &Constants,
) -> (ArchetypeContext, ContextHandle) {
    ArchetypeContext::builder(Value::number(self_id), AClient)
        .constants(constants)
        .resource(
            "net",
            network_maker(self_id, base_port, MailboxConfig::default()),
        )
        .resource("input", InputChannel::maker(input))
        .resource("output", OutputChannel::maker(output))
        .resource("req", LocalRegister::maker(Value::number(0)))
        .finish()
}
