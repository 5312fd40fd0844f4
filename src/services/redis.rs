//! Redis 3.2 over RESP.
//!
//! Commands are looked up case-insensitively in a table of plain function
//! pointers. Every handler validates its own arguments and answers with
//! either a reply or a RESP error line; neither ends the connection.

use super::{settle, Connection, Service, ServiceBase, ServiceKind};
use crate::config::Limits;
use crate::error::PipelineError;
use crate::event::EventSink;
use crate::metrics::{Metrics, Timer};
use crate::protocol::resp::DEFAULT_MAX_BULK_LEN;
use crate::protocol::{RedisDatum, Request, RespCommand, RespParser};
use crate::server::framer::{Framed, RequestFramer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handlers get the lowercased name they were invoked under.
type CommandFn = fn(&CommandTable, &str, &[RedisDatum]) -> RedisDatum;

/// Keys the fake keyspace admits to.
const CANNED_KEYS: [&str; 4] = ["session:2f1a", "user:1000", "cache:index", "queue:jobs"];

const INFO_SECTIONS: [(&str, &str); 10] = [
    (
        "server",
        "# Server\r\n\
         redis_version:3.2.8\r\n\
         redis_git_sha1:00000000\r\n\
         redis_git_dirty:0\r\n\
         redis_build_id:87ef1ab0af40c0a5\r\n\
         redis_mode:standalone\r\n\
         os:Linux 4.9.0-3-amd64 x86_64\r\n\
         arch_bits:64\r\n\
         multiplexing_api:epoll\r\n\
         gcc_version:6.3.0\r\n\
         process_id:1022\r\n\
         run_id:a1c4f3e0f1d7c1b5cd2a9b0e8f7d6c5b4a392817\r\n\
         tcp_port:6379\r\n\
         uptime_in_seconds:1729021\r\n\
         uptime_in_days:20\r\n\
         hz:10\r\n\
         lru_clock:8911204\r\n\
         executable:/usr/bin/redis-server\r\n\
         config_file:/etc/redis/redis.conf\r\n",
    ),
    (
        "clients",
        "# Clients\r\n\
         connected_clients:1\r\n\
         client_longest_output_list:0\r\n\
         client_biggest_input_buf:0\r\n\
         blocked_clients:0\r\n",
    ),
    (
        "memory",
        "# Memory\r\n\
         used_memory:830488\r\n\
         used_memory_human:811.02K\r\n\
         used_memory_rss:4005888\r\n\
         used_memory_rss_human:3.82M\r\n\
         used_memory_peak:891384\r\n\
         used_memory_peak_human:870.49K\r\n\
         total_system_memory:2097205248\r\n\
         total_system_memory_human:1.95G\r\n\
         maxmemory:0\r\n\
         maxmemory_human:0B\r\n\
         maxmemory_policy:noeviction\r\n\
         mem_fragmentation_ratio:4.82\r\n\
         mem_allocator:jemalloc-3.6.0\r\n",
    ),
    (
        "persistence",
        "# Persistence\r\n\
         loading:0\r\n\
         rdb_changes_since_last_save:0\r\n\
         rdb_bgsave_in_progress:0\r\n\
         rdb_last_save_time:1504170217\r\n\
         rdb_last_bgsave_status:ok\r\n\
         rdb_last_bgsave_time_sec:0\r\n\
         rdb_current_bgsave_time_sec:-1\r\n\
         aof_enabled:0\r\n\
         aof_rewrite_in_progress:0\r\n\
         aof_rewrite_scheduled:0\r\n\
         aof_last_rewrite_time_sec:-1\r\n\
         aof_current_rewrite_time_sec:-1\r\n\
         aof_last_bgrewrite_status:ok\r\n\
         aof_last_write_status:ok\r\n",
    ),
    (
        "stats",
        "# Stats\r\n\
         total_connections_received:1286\r\n\
         total_commands_processed:4127\r\n\
         instantaneous_ops_per_sec:0\r\n\
         total_net_input_bytes:163582\r\n\
         total_net_output_bytes:2749961\r\n\
         instantaneous_input_kbps:0.00\r\n\
         instantaneous_output_kbps:0.00\r\n\
         rejected_connections:0\r\n\
         sync_full:0\r\n\
         sync_partial_ok:0\r\n\
         sync_partial_err:0\r\n\
         expired_keys:12\r\n\
         evicted_keys:0\r\n\
         keyspace_hits:907\r\n\
         keyspace_misses:113\r\n\
         pubsub_channels:0\r\n\
         pubsub_patterns:0\r\n\
         latest_fork_usec:412\r\n\
         migrate_cached_sockets:0\r\n",
    ),
    (
        "replication",
        "# Replication\r\n\
         role:master\r\n\
         connected_slaves:0\r\n\
         master_repl_offset:0\r\n\
         repl_backlog_active:0\r\n\
         repl_backlog_size:1048576\r\n\
         repl_backlog_first_byte_offset:0\r\n\
         repl_backlog_histlen:0\r\n",
    ),
    (
        "cpu",
        "# CPU\r\n\
         used_cpu_sys:1201.47\r\n\
         used_cpu_user:538.09\r\n\
         used_cpu_sys_children:0.04\r\n\
         used_cpu_user_children:0.01\r\n",
    ),
    (
        "commandstats",
        "# Commandstats\r\n\
         cmdstat_get:calls=1020,usec=5712,usec_per_call=5.60\r\n\
         cmdstat_set:calls=2011,usec=14077,usec_per_call=7.00\r\n\
         cmdstat_info:calls=41,usec=3526,usec_per_call=86.00\r\n\
         cmdstat_ping:calls=1055,usec=1055,usec_per_call=1.00\r\n",
    ),
    ("cluster", "# Cluster\r\ncluster_enabled:0\r\n"),
    ("keyspace", "# Keyspace\r\ndb0:keys=4,expires=0,avg_ttl=0\r\n"),
];

/// Command, CONFIG subcommand and INFO section tables.
pub struct CommandTable {
    commands: HashMap<&'static str, CommandFn>,
    config: HashMap<&'static str, CommandFn>,
    sections: HashMap<&'static str, &'static str>,
    info_default: String,
    info_all: String,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        let mut commands: HashMap<&'static str, CommandFn> = HashMap::new();
        commands.insert("info", info);
        commands.insert("flushall", flushall);
        commands.insert("save", save);
        commands.insert("set", set);
        commands.insert("config", config);
        commands.insert("ping", ping);
        commands.insert("echo", echo);
        commands.insert("auth", auth);
        commands.insert("select", select);
        commands.insert("get", get);
        commands.insert("keys", keys);
        commands.insert("dbsize", dbsize);
        commands.insert("slaveof", replicaof);
        commands.insert("replicaof", replicaof);
        commands.insert("command", command);
        commands.insert("quit", quit);

        let mut config: HashMap<&'static str, CommandFn> = HashMap::new();
        config.insert("get", config_get);
        config.insert("set", config_set);
        config.insert("resetstat", config_resetstat);
        config.insert("rewrite", config_rewrite);

        let join = |include: &dyn Fn(&str) -> bool| {
            INFO_SECTIONS
                .iter()
                .filter(|(name, _)| include(*name))
                .map(|(_, text)| *text)
                .collect::<Vec<_>>()
                .join("\r\n")
        };

        Self {
            commands,
            config,
            sections: INFO_SECTIONS.into_iter().collect(),
            info_default: join(&|name: &str| name != "commandstats"),
            info_all: join(&|_: &str| true),
        }
    }

    /// Resolve and run a command. `None` when the name is not in the table.
    pub fn dispatch(&self, cmd: &RespCommand) -> Option<RedisDatum> {
        let name = cmd.name.to_ascii_lowercase();
        let handler = self.commands.get(name.as_str())?;
        Some(handler(self, &name, &cmd.args))
    }
}

fn wrong_arity(cmd: &str) -> RedisDatum {
    RedisDatum::error(format!("ERR wrong number of arguments for '{}' command", cmd))
}

fn syntax_error() -> RedisDatum {
    RedisDatum::error("ERR syntax error")
}

/// Lowercased string argument, or the error reply to send instead.
fn word(arg: &RedisDatum) -> Result<String, RedisDatum> {
    arg.as_str()
        .map(str::to_ascii_lowercase)
        .map_err(|e| RedisDatum::error(format!("ERR {}", e)))
}

fn info(table: &CommandTable, _cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    match args {
        [] => RedisDatum::bulk(table.info_default.clone()),
        [arg] => match word(arg) {
            Ok(w) if w == "default" => RedisDatum::bulk(table.info_default.clone()),
            Ok(w) if w == "all" => RedisDatum::bulk(table.info_all.clone()),
            Ok(w) => match table.sections.get(w.as_str()) {
                Some(text) => RedisDatum::bulk(*text),
                None => RedisDatum::bulk("\r\n"),
            },
            Err(reply) => reply,
        },
        _ => syntax_error(),
    }
}

fn flushall(_: &CommandTable, _cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    match args {
        [] => RedisDatum::ok(),
        [arg] => match word(arg) {
            Ok(w) if w == "async" => RedisDatum::ok(),
            Ok(_) => syntax_error(),
            Err(reply) => reply,
        },
        _ => syntax_error(),
    }
}

fn save(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    if args.is_empty() {
        RedisDatum::ok()
    } else {
        wrong_arity(cmd)
    }
}

fn set(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    match args.len() {
        2 => RedisDatum::ok(),
        0 | 1 => wrong_arity(cmd),
        _ => syntax_error(),
    }
}

/// CONFIG handlers see the subcommand as their first argument.
fn config(table: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    let Some(first) = args.first() else {
        return wrong_arity(cmd);
    };
    let sub = match word(first) {
        Ok(sub) => sub,
        Err(reply) => return reply,
    };
    match table.config.get(sub.as_str()) {
        Some(handler) => handler(table, &sub, args),
        None => RedisDatum::error("ERR CONFIG subcommand must be one of GET, SET, RESETSTAT, REWRITE"),
    }
}

fn config_arity(sub: &str) -> RedisDatum {
    RedisDatum::error(format!("ERR Wrong number of arguments for CONFIG {}", sub))
}

fn config_get(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    if args.len() == 2 {
        RedisDatum::empty_array()
    } else {
        config_arity(cmd)
    }
}

fn config_set(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    if args.len() == 3 {
        RedisDatum::ok()
    } else {
        config_arity(cmd)
    }
}

fn config_resetstat(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    if args.len() == 1 {
        RedisDatum::ok()
    } else {
        config_arity(cmd)
    }
}

fn config_rewrite(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    if args.len() == 1 {
        RedisDatum::ok()
    } else {
        config_arity(cmd)
    }
}

fn ping(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    match args {
        [] => RedisDatum::simple("PONG"),
        [msg] => echo_back(msg),
        _ => wrong_arity(cmd),
    }
}

fn echo(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    match args {
        [msg] => echo_back(msg),
        _ => wrong_arity(cmd),
    }
}

fn echo_back(msg: &RedisDatum) -> RedisDatum {
    match msg {
        RedisDatum::BulkString(data) => RedisDatum::BulkString(data.clone()),
        other => match other.as_str() {
            Ok(s) => RedisDatum::bulk(s.to_string()),
            Err(e) => RedisDatum::error(format!("ERR {}", e)),
        },
    }
}

fn auth(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    match args {
        [_] => RedisDatum::error("ERR Client sent AUTH, but no password is set"),
        _ => wrong_arity(cmd),
    }
}

fn select(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    match args {
        [db] => match db.as_int() {
            Ok(0..=15) => RedisDatum::ok(),
            Ok(_) => RedisDatum::error("ERR DB index is out of range"),
            Err(_) => RedisDatum::error("ERR invalid DB index"),
        },
        _ => wrong_arity(cmd),
    }
}

fn get(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    match args {
        [_] => RedisDatum::Nil,
        _ => wrong_arity(cmd),
    }
}

fn keys(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    match args {
        [pattern] => match pattern.as_str() {
            Ok("*") => RedisDatum::Array(CANNED_KEYS.iter().map(|k| RedisDatum::bulk(*k)).collect()),
            Ok(_) => RedisDatum::empty_array(),
            Err(e) => RedisDatum::error(format!("ERR {}", e)),
        },
        _ => wrong_arity(cmd),
    }
}

fn dbsize(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    if args.is_empty() {
        RedisDatum::Integer(CANNED_KEYS.len() as i64)
    } else {
        wrong_arity(cmd)
    }
}

fn replicaof(_: &CommandTable, cmd: &str, args: &[RedisDatum]) -> RedisDatum {
    if args.len() == 2 {
        RedisDatum::ok()
    } else {
        wrong_arity(cmd)
    }
}

fn command(_: &CommandTable, _cmd: &str, _args: &[RedisDatum]) -> RedisDatum {
    RedisDatum::empty_array()
}

/// Replies `+OK`; the session loop closes the connection afterwards.
fn quit(_: &CommandTable, _cmd: &str, _args: &[RedisDatum]) -> RedisDatum {
    RedisDatum::ok()
}

pub struct Redis {
    base: ServiceBase,
    table: Arc<CommandTable>,
}

impl Redis {
    pub fn new(name: &str, limits: Limits) -> Self {
        Self {
            base: ServiceBase::new(name, ServiceKind::Redis, limits),
            table: Arc::new(CommandTable::new()),
        }
    }

    async fn serve(&self, conn: Connection) -> Result<(), PipelineError> {
        let emitter = self.base.emitter(&conn);
        let limits = &self.base.limits;
        let mut framer = RequestFramer::new(conn.stream).with_read_timeout(limits.read_timeout());
        let mut parser = RespParser::with_limits(DEFAULT_MAX_BULK_LEN, limits.max_inline_size);

        loop {
            let Framed { item: cmd, raw } = framer.next(&mut parser).await?;
            let timer = Timer::new();
            debug!("Received command: {} ({} args)", cmd.name, cmd.args.len());

            emitter.emit(emitter.event(Request::from(&cmd), raw));

            let reply = self.table.dispatch(&cmd).unwrap_or_else(|| {
                warn!("Redis command {:?} not supported", cmd.name);
                Metrics::get().record_unknown(self.base.category);
                RedisDatum::error(format!("ERR unknown command '{}'", cmd.name))
            });
            framer.write_response(&reply.to_bytes()?).await?;

            Metrics::get().record_request(self.base.category, timer.elapsed_seconds());
            if cmd.name.eq_ignore_ascii_case("quit") {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Service for Redis {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn category(&self) -> &'static str {
        self.base.category
    }

    fn attach_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.base.sink = sink;
    }

    async fn handle(&self, conn: Connection) -> Result<(), PipelineError> {
        settle(self.serve(conn).await)
    }
}
