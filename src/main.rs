use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use rrcache::{
    CachedType, DnsData, FindRequest, LookupResult, Registry, RrcacheConfig, load_config,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "rrcache DNS record cache", long_about = None)]
struct Args {
    /// 配置文件路径（JSON），不指定则使用缺省参数
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// 预加载的应答（JSON 文件，每个内层数组是一个记录集）
    #[arg(short = 'r', long = "records")]
    records: Option<PathBuf>,
    /// 查询，格式为 TYPE:NAME，可重复
    #[arg(short = 'q', long = "query")]
    queries: Vec<QuerySpec>,
    /// 追加的域名后缀，排在配置文件中的后缀之后
    #[arg(long = "suffix")]
    suffixes: Vec<String>,
    /// 查询结束后输出缓存内容和统计
    #[arg(long = "dump", default_value_t = false)]
    dump: bool,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[derive(Debug, Clone)]
struct QuerySpec {
    qtype: CachedType,
    name: String,
}

impl FromStr for QuerySpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (qtype, name) = s
            .split_once(':')
            .ok_or_else(|| format!("expected TYPE:NAME, got {s}"))?;
        let qtype = qtype.parse::<CachedType>().map_err(|err| err.to_string())?;
        if name.is_empty() {
            return Err("empty query name".into());
        }
        Ok(Self {
            qtype,
            name: name.to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = match &args.config {
        Some(path) => load_config(path).context("load config")?,
        None => RrcacheConfig::default(),
    };

    let registry = Registry::new();
    let client = registry
        .attach(0, "cli", &cfg.cache)
        .context("attach cache daemon")?;

    if let Some(path) = &args.records {
        let sets = load_records(path)?;
        let mut cached = 0;
        for (idx, set) in sets.iter().enumerate() {
            match client.cache_answers(set) {
                Ok(()) => cached += 1,
                Err(err) => warn!(set = idx, error = %err, "record set skipped"),
            }
        }
        info!(sets = sets.len(), cached, "records preloaded");
    }

    let mut suffixes = cfg.domain_suffixes.clone();
    suffixes.extend(args.suffixes.iter().cloned());

    let stdout = io::stdout();
    for query in &args.queries {
        let request =
            FindRequest::new(query.qtype, query.name.clone()).with_suffixes(suffixes.iter().cloned());
        let result = client
            .lookup(&request)
            .await
            .with_context(|| format!("lookup {}:{}", query.qtype, query.name))?;

        let mut out = stdout.lock();
        match result {
            LookupResult::Records(records) => {
                for record in &records {
                    writeln!(out, "{}", serde_json::to_string(record)?)?;
                }
            }
            LookupResult::Negative(status) => {
                writeln!(out, "{}", serde_json::to_string(&status)?)?;
            }
            LookupResult::InsufficientBuffer { required } => {
                writeln!(out, "{}:{} needs {required} bytes", query.qtype, query.name)?;
            }
            LookupResult::Miss { missing_suffixes } => {
                writeln!(
                    out,
                    "{}:{} not cached (missing {missing_suffixes:#b})",
                    query.qtype, query.name
                )?;
            }
        }
    }

    if args.dump {
        let mut out = stdout.lock();
        client.daemon().dump(&mut out).context("dump cache")?;
        writeln!(out, "{}", serde_json::to_string(&client.stats())?)?;
    }

    Ok(())
}

fn load_records(path: &Path) -> anyhow::Result<Vec<Vec<DnsData>>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read records file: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse records file: {}", path.display()))
}

fn init_tracing(debug: bool) {
    // 日志写到 stderr，stdout 只留查询结果
    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
