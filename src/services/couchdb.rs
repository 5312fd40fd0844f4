//! CouchDB 1.7 REST API.

use super::{settle, Connection, Service, ServiceBase, ServiceKind};
use crate::config::Limits;
use crate::error::PipelineError;
use crate::event::EventSink;
use crate::metrics::{Metrics, Timer};
use crate::protocol::http::http_date;
use crate::protocol::{HttpParser, HttpResponse, Request};
use crate::server::framer::{Framed, RequestFramer};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub const SERVER_HEADER: &str = "CouchDB/1.7.1 (Erlang OTP/19)";

pub struct CouchDb {
    base: ServiceBase,
    /// Path -> pre-rendered JSON body.
    routes: HashMap<&'static str, Vec<u8>>,
}

impl CouchDb {
    pub fn new(name: &str, limits: Limits) -> Self {
        let routes = [
            ("/", welcome()),
            ("/_all_dbs", json!(["_replicator", "_users"])),
            ("/_config", config_tree()),
        ]
        .into_iter()
        .map(|(path, doc)| (path, render(&doc)))
        .collect();

        Self {
            base: ServiceBase::new(name, ServiceKind::Couchdb, limits),
            routes,
        }
    }

    fn body_for(&self, path: &str) -> Vec<u8> {
        match self.routes.get(path) {
            Some(body) => body.clone(),
            None => {
                warn!("CouchDB path {:?} not supported", path);
                Metrics::get().record_unknown(self.base.category);
                Vec::new()
            }
        }
    }

    async fn serve(&self, conn: Connection) -> Result<(), PipelineError> {
        let emitter = self.base.emitter(&conn);
        let limits = &self.base.limits;
        let mut framer = RequestFramer::new(conn.stream).with_read_timeout(limits.read_timeout());
        let mut parser = HttpParser::new(limits.max_header_size, limits.max_body_size);

        let Framed { item: req, raw } = framer.next(&mut parser).await?;
        let timer = Timer::new();
        let path = req.path().to_string();

        let event = emitter
            .event(Request::from(&req), raw)
            .with_kind(path.clone())
            .with_field("couchdb.method", path.clone());
        emitter.emit(event);

        let response = HttpResponse::ok(&req.version)
            .with_header("Content-Type", "text/plain; charset=UTF-8")
            .with_header("Cache-Control", "must-revalidate")
            .with_header("Server", SERVER_HEADER)
            .with_header("Date", http_date(Utc::now()))
            .with_body(self.body_for(&path));
        framer.write_response(&response.to_bytes()?).await?;

        Metrics::get().record_request(self.base.category, timer.elapsed_seconds());
        Ok(())
    }
}

/// CouchDB terminates JSON bodies with a newline.
fn render(doc: &Value) -> Vec<u8> {
    let mut out = doc.to_string().into_bytes();
    out.push(b'\n');
    out
}

fn welcome() -> Value {
    json!({
        "couchdb": "Welcome",
        "uuid": "0bd1e2e1ab8a7e31a0a1c7ac0e0f2b6d",
        "version": "1.7.1",
        "vendor": {
            "name": "The Apache Software Foundation",
            "version": "1.7.1"
        }
    })
}

fn config_tree() -> Value {
    json!({
        "couchdb": {
            "database_dir": "/usr/local/var/lib/couchdb",
            "view_index_dir": "/usr/local/var/lib/couchdb",
            "uri_file": "/usr/local/var/lib/couchdb/couch.uri",
            "max_document_size": "4294967296",
            "os_process_timeout": "5000",
            "max_dbs_open": "100",
            "delayed_commits": "true",
            "uuid": "0bd1e2e1ab8a7e31a0a1c7ac0e0f2b6d"
        },
        "httpd": {
            "port": "5984",
            "bind_address": "0.0.0.0",
            "authentication_handlers": "{couch_httpd_oauth, oauth_authentication_handler}, {couch_httpd_auth, cookie_authentication_handler}, {couch_httpd_auth, default_authentication_handler}",
            "default_handler": "{couch_httpd_db, handle_request}",
            "enable_cors": "false",
            "allow_jsonp": "false",
            "socket_options": "[{recbuf, 262144}, {sndbuf, 262144}]",
            "vhost_global_handlers": "_utils, _uuids, _session, _oauth, _users"
        },
        "couch_httpd_auth": {
            "authentication_db": "_users",
            "authentication_redirect": "/_utils/session.html",
            "require_valid_user": "false",
            "timeout": "600",
            "iterations": "10"
        },
        "log": {
            "file": "/usr/local/var/log/couchdb/couch.log",
            "level": "info",
            "include_sasl": "true"
        },
        "query_servers": {
            "javascript": "/usr/local/bin/couchjs /usr/local/share/couchdb/server/main.js",
            "coffeescript": "/usr/local/bin/couchjs /usr/local/share/couchdb/server/main-coffee.js"
        },
        "daemons": {
            "auth_cache": "{couch_auth_cache, start_link, []}",
            "db_update_notifier": "{couch_db_update_notifier_sup, start_link, []}",
            "httpd": "{couch_httpd, start_link, []}",
            "index_server": "{couch_index_server, start_link, []}",
            "os_daemons": "{couch_os_daemons, start_link, []}",
            "replicator_manager": "{couch_replicator_manager, start_link, []}",
            "uuids": "{couch_uuids, start, []}",
            "vhosts": "{couch_httpd_vhost, start_link, []}"
        },
        "replicator": {
            "db": "_replicator",
            "max_replication_retry_count": "10",
            "worker_processes": "4",
            "http_connections": "20"
        },
        "uuids": {
            "algorithm": "sequential",
            "max_count": "1000"
        },
        "vendor": {
            "name": "The Apache Software Foundation",
            "version": "1.7.1"
        }
    })
}

#[async_trait]
impl Service for CouchDb {
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
