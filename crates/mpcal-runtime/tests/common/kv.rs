//! The replicated key-value store: clients broadcast `Put`s to every
//! replica (one atomic critical section per broadcast), serve `Get`s from
//! their home replica, and carry a logical clock that increments per
//! operation and pins at `-1` after `Disconnect`.
//!
//! Node identifiers: replicas `1..=NUM_REPLICAS`, then clients. Mailboxes
//! are indexed by `<<node, message_type>>` with two message types.

use async_trait::async_trait;
use mpcal_runtime::context::{Archetype, ArchetypeContext, Constants, ContextHandle};
use mpcal_runtime::error::Result;
use mpcal_runtime::resource::ResourceMaker;
use mpcal_runtime::resources::{
    InputChannel, LocalRegister, MailboxConfig, MailboxKind, OutputChannel, TcpMailboxes,
};
use mpcal_tla::Value;
use tokio::sync::mpsc;

/// Client request to a replica.
pub const REQ_MSG_TYP: i64 = 1;
/// Replica response to a client.
pub const RESP_MSG_TYP: i64 = 2;

const NUM_MSG_TYPES: i64 = 2;

/// Mailbox index `<<node, message_type>>`.
pub fn mailbox_index(node: i64, msg_type: i64) -> Value {
    Value::tuple([Value::number(node), Value::number(msg_type)])
}

/// Constants every node of the KV system binds.
pub fn kv_constants(num_replicas: i64, num_clients: i64) -> Constants {
    Constants::new([
        ("NUM_REPLICAS", Value::number(num_replicas)),
        ("NUM_CLIENTS", Value::number(num_clients)),
    ])
}

/// Mailbox network maker for the KV port layout.
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
// AReplica
// ---------------------------------------------------------------------

/// One replica: applies puts, answers gets from its database, and drops
/// everything further from disconnected clients.
pub struct AReplica;

#[async_trait]
impl Archetype for AReplica {
    fn name(&self) -> &'static str {
        "AReplica"
    }

    fn entry_label(&self) -> &'static str {
        "replicaLoop"
    }

    async fn section(&self, label: &str, ctx: &mut ArchetypeContext) -> Result<()> {
        match label {
            "replicaLoop" => {
                let me = ctx.self_id().as_number()?;
                let msg = ctx.read("net", &[mailbox_index(me, REQ_MSG_TYP)]).await?;
                ctx.write("m", &[], msg).await?;
                ctx.goto("replicaHandle").await
            },
            "replicaHandle" => {
                let msg = ctx.read("m", &[]).await?;
                let from = msg.dot("from")?;
                let disconnected = ctx.read("disc", &[]).await?;
                if disconnected.contains(&from)? {
                    // Nothing from a disconnected client is observable.
                    return ctx.goto("replicaLoop").await;
                }
                match msg.dot("op")?.as_str()? {
                    "disconnect" => {
                        let updated = disconnected.union(&Value::set([from]))?;
                        ctx.write("disc", &[], updated).await?;
                        ctx.goto("replicaLoop").await
                    },
                    "put" => {
                        let key = msg.dot("key")?;
                        let value = msg.dot("value")?;
                        let db = ctx.read("db", &[]).await?;
                        ctx.write("db", &[], db.update(key.clone(), value)?).await?;
                        let ack = Value::record([
                            ("type", Value::string("put_ack")),
                            ("key", key),
                            ("from", ctx.self_id().clone()),
                        ]);
                        let client = from.as_number()?;
                        ctx.write("net", &[mailbox_index(client, RESP_MSG_TYP)], ack)
                            .await?;
                        ctx.goto("replicaLoop").await
                    },
                    "get" => {
                        let key = msg.dot("key")?;
                        let db = ctx.read("db", &[]).await?;
                        let value = if db.domain()?.contains(&key)? {
                            db.apply(&key)?
                        } else {
                            Value::string("null")
                        };
                        let response = Value::record([
                            ("type", Value::string("get_resp")),
                            ("key", key),
                            ("value", value),
                            ("from", ctx.self_id().clone()),
                        ]);
                        let client = from.as_number()?;
                        ctx.write("net", &[mailbox_index(client, RESP_MSG_TYP)], response)
                            .await?;
                        ctx.goto("replicaLoop").await
                    },
                    other => unreachable!("AReplica has no operation {other}"),
                }
            },
            other => unreachable!("AReplica has no label {other}"),
        }
    }
}

/// Deployment wiring for a replica node.
pub fn replica_ctx(
    self_id: i64,
    base_port: u16,
    constants: &Constants,
) -> (ArchetypeContext, ContextHandle) {
    ArchetypeContext::builder(Value::number(self_id), AReplica)
        .constants(constants)
        .resource(
            "net",
            network_maker(self_id, base_port, MailboxConfig::default()),
        )
        .resource("m", LocalRegister::maker(Value::number(0)))
        .resource("db", LocalRegister::maker(Value::function([])))
        .resource("disc", LocalRegister::maker(Value::set([])))
        .finish()
}

// ---------------------------------------------------------------------
// AKvClient
// ---------------------------------------------------------------------

/// One KV client. Host requests are records with an `op` field:
/// `put {key, value}`, `get {key}`, or `disconnect {}`. Every host-visible
/// output carries the client's logical clock.
pub struct AKvClient;

fn home_replica(ctx: &ArchetypeContext) -> Result<i64> {
    let num_replicas = ctx.constant("NUM_REPLICAS")?.as_number()?;
    let me = ctx.self_id().as_number()?;
    Ok((me - num_replicas - 1) % num_replicas + 1)
}

#[async_trait]
impl Archetype for AKvClient {
    fn name(&self) -> &'static str {
        "AKvClient"
    }

    fn entry_label(&self) -> &'static str {
        "kvLoop"
    }

    async fn section(&self, label: &str, ctx: &mut ArchetypeContext) -> Result<()> {
        match label {
            "kvLoop" => {
                let request = ctx.read("input", &[]).await?;
                ctx.write("req", &[], request).await?;
                ctx.goto("kvDispatch").await
            },
            "kvDispatch" => {
                let request = ctx.read("req", &[]).await?;
                let clock = ctx.read("clock", &[]).await?.as_number()?;
                let op = request.dot("op")?;
                let me = ctx.self_id().clone();

                if clock == -1 && op.as_str()? != "disconnect" {
                    // A disconnected client can no longer act.
                    let rejection = Value::record([
                        ("type", Value::string("rejected")),
                        ("clock", Value::number(-1)),
                    ]);
                    ctx.write("output", &[], rejection).await?;
                    return ctx.goto("kvLoop").await;
                }

                match op.as_str()? {
                    "disconnect" => {
                        ctx.write("clock", &[], Value::number(-1)).await?;
                        let num_replicas = ctx.constant("NUM_REPLICAS")?.as_number()?;
                        let notice = Value::record([
                            ("op", Value::string("disconnect")),
                            ("from", me),
                            ("clock", Value::number(-1)),
                        ]);
                        for replica in 1..=num_replicas {
                            ctx.write(
                                "net",
                                &[mailbox_index(replica, REQ_MSG_TYP)],
                                notice.clone(),
                            )
                            .await?;
                        }
                        let confirmation = Value::record([
                            ("type", Value::string("disconnected")),
                            ("clock", Value::number(-1)),
                        ]);
                        ctx.write("output", &[], confirmation).await?;
                        ctx.goto("kvLoop").await
                    },
                    "put" => {
                        let next = clock + 1;
                        ctx.write("clock", &[], Value::number(next)).await?;
                        let num_replicas = ctx.constant("NUM_REPLICAS")?.as_number()?;
                        let message = Value::record([
                            ("op", Value::string("put")),
                            ("key", request.dot("key")?),
                            ("value", request.dot("value")?),
                            ("from", me),
                            ("clock", Value::number(next)),
                        ]);
                        // One atomic broadcast: all replicas or none.
                        for replica in 1..=num_replicas {
                            ctx.write(
                                "net",
                                &[mailbox_index(replica, REQ_MSG_TYP)],
                                message.clone(),
                            )
                            .await?;
                        }
                        ctx.write("acks", &[], Value::number(0)).await?;
                        ctx.goto("putAwait").await
                    },
                    "get" => {
                        let next = clock + 1;
                        ctx.write("clock", &[], Value::number(next)).await?;
                        let message = Value::record([
                            ("op", Value::string("get")),
                            ("key", request.dot("key")?),
                            ("from", me),
                            ("clock", Value::number(next)),
                        ]);
                        let replica = home_replica(ctx)?;
                        ctx.write("net", &[mailbox_index(replica, REQ_MSG_TYP)], message)
                            .await?;
                        ctx.goto("getAwait").await
                    },
                    other => unreachable!("AKvClient has no operation {other}"),
                }
            },
            "putAwait" => {
                let acks = ctx.read("acks", &[]).await?.as_number()?;
                let num_replicas = ctx.constant("NUM_REPLICAS")?.as_number()?;
                if acks < num_replicas {
                    let me = ctx.self_id().as_number()?;
                    let _ack = ctx.read("net", &[mailbox_index(me, RESP_MSG_TYP)]).await?;
                    ctx.write("acks", &[], Value::number(acks + 1)).await?;
                    ctx.goto("putAwait").await
                } else {
                    let request = ctx.read("req", &[]).await?;
                    let clock = ctx.read("clock", &[]).await?;
                    let confirmation = Value::record([
                        ("type", Value::string("put_ok")),
                        ("key", request.dot("key")?),
                        ("clock", clock),
                    ]);
                    ctx.write("output", &[], confirmation).await?;
                    ctx.goto("kvLoop").await
                }
            },
            "getAwait" => {
                let me = ctx.self_id().as_number()?;
                let response = ctx.read("net", &[mailbox_index(me, RESP_MSG_TYP)]).await?;
                let clock = ctx.read("clock", &[]).await?;
                let output = Value::record([
                    ("type", Value::string("get_resp")),
                    ("key", response.dot("key")?),
                    ("value", response.dot("value")?),
                    ("clock", clock),
                ]);
                ctx.write("output", &[], output).await?;
                ctx.goto("kvLoop").await
            },
            other => unreachable!("AKvClient has no label {other}"),
        }
    }
}

/// Deployment wiring for a KV client node.
pub fn kv_client_ctx(
    self_id: i64,
    base_port: u16,
    input: mpsc::Receiver<Value>,
    output: mpsc::Sender<Value>,
    constants: &Constants,
) -> (ArchetypeContext, ContextHandle) {
    ArchetypeContext::builder(Value::number(self_id), AKvClient)
        .constants(constants)
        .resource(
            "net",
            network_maker(self_id, base_port, MailboxConfig::default()),
        )
        .resource("input", InputChannel::maker(input))
        .resource("output", OutputChannel::maker(output))
        .resource("req", LocalRegister::maker(Value::number(0)))
        .resource("clock", LocalRegister::maker(Value::number(0)))
        .resource("acks", LocalRegister::maker(Value::number(0)))
        .finish()
}
