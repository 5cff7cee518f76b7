use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

use jobqueue_config::{AppConfig, StoreBackend};
use jobqueue_domain::{DeadLetterEntry, Job, JobType};
use jobqueue_infrastructure::StoreFactory;
use jobqueue_supervisor::{
    CancelOutcome, HeartbeatRegistryConfig, JobService, SubmitJobRequest, WorkerView,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliApp::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    cli.run().await
}

/// CLI应用程序主结构
#[derive(Parser, Debug)]
#[command(name = "jobqueue-cli")]
#[command(version = "1.0.0")]
#[command(about = "分布式作业队列 - 命令行管理工具")]
#[command(long_about = "直接连接共享存储，提供作业提交、状态查询、取消、死信队列与Worker查看等功能")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径，未指定时按默认路径查找
    #[arg(short, long)]
    config: Option<String>,

    /// 以JSON格式输出
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 提交作业
    Submit {
        /// 作业类型 (migration / backtest)
        #[arg(short = 't', long = "type")]
        job_type: JobType,
        /// 作业载荷 (JSON格式)
        #[arg(short, long)]
        payload: Option<String>,
        /// 指定作业ID，默认按载荷生成
        #[arg(long)]
        job_id: Option<String>,
        /// 最大尝试次数，默认取配置
        #[arg(short, long)]
        max_attempts: Option<u32>,
    },
    /// 查看作业状态
    Status {
        /// 作业ID
        job_id: String,
    },
    /// 列出作业
    List {
        /// 作业类型过滤
        #[arg(short = 't', long = "type")]
        job_type: Option<JobType>,
        /// 显示数量
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// 取消作业
    Cancel {
        /// 作业ID
        job_id: String,
    },
    /// 死信队列管理
    Dlq(DlqCommands),
    /// 列出Worker及其心跳
    Workers,
    /// 查看各类型队列深度
    Queues,
    /// 配置管理
    Config(ConfigCommands),
}

#[derive(Args, Debug)]
struct DlqCommands {
    #[command(subcommand)]
    action: DlqActions,
}

#[derive(Subcommand, Debug)]
enum DlqActions {
    /// 列出死信作业
    List,
    /// 将死信作业重新排队，尝试次数重置
    Requeue {
        /// 作业ID
        job_id: String,
    },
}

#[derive(Args, Debug)]
struct ConfigCommands {
    #[command(subcommand)]
    action: ConfigActions,
}

#[derive(Subcommand, Debug)]
enum ConfigActions {
    /// 显示当前生效的配置
    Show,
    /// 验证配置文件
    Validate,
    /// 输出示例配置
    Example,
}

impl CliApp {
    async fn run(self) -> Result<()> {
        match self.command {
            Commands::Config(config_cmd) => {
                handle_config_commands(&config_cmd, self.config.as_deref())
            }
            command => run_service_command(command, self.config.as_deref(), self.json).await,
        }
    }
}

async fn run_service_command(
    command: Commands,
    config_path: Option<&str>,
    as_json: bool,
) -> Result<()> {
    let config = AppConfig::load(config_path).context("加载配置文件失败")?;
    if config.store.backend == StoreBackend::Memory {
        eprintln!("警告: 当前使用进程内存储，命令只作用于本进程，不会影响运行中的Worker");
    }

    let stores = StoreFactory::create(&config.store)
        .await
        .context("连接存储失败")?;
    let dead_timeout =
        HeartbeatRegistryConfig::from_config(&config.worker, &config.heartbeat).dead_timeout();
    let service = JobService::new(stores, config.jobs.clone(), dead_timeout);

    match command {
        Commands::Submit {
            job_type,
            payload,
            job_id,
            max_attempts,
        } => {
            let payload = match payload {
                Some(payload_str) => serde_json::from_str::<Value>(&payload_str)
                    .context("解析作业载荷失败，请确保是有效的JSON格式")?,
                None => json!({}),
            };

            let request = SubmitJobRequest {
                job_type,
                payload,
                job_id,
                max_attempts,
            };
            let job = service.submit_job(request).await?;

            if as_json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                println!("作业提交成功!");
                println!("作业ID: {}", job.job_id);
                println!("最大尝试次数: {}", job.max_attempts);
            }
        }
        Commands::Status { job_id } => {
            let job = service.get_job(&job_id).await?;
            if as_json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job_details(&job)?;
            }
        }
        Commands::List { job_type, limit } => {
            let page = service.list_jobs(limit, job_type).await?;
            if as_json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                print_jobs_table(&page.jobs);
                println!("共 {} 个作业，显示 {} 个", page.total, page.jobs.len());
            }
        }
        Commands::Cancel { job_id } => match service.cancel_job(&job_id).await? {
            CancelOutcome::Cancelled => println!("作业已取消: {job_id}"),
            CancelOutcome::CancelRequested => {
                println!("作业正在运行，已发送取消请求: {job_id}")
            }
            CancelOutcome::AlreadyFinished(status) => {
                println!("作业已结束，无法取消: {job_id} ({status})")
            }
        },
        Commands::Dlq(dlq_cmd) => match dlq_cmd.action {
            DlqActions::List => {
                let entries = service.list_dlq().await?;
                if as_json {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                } else {
                    print_dlq_table(&entries);
                }
            }
            DlqActions::Requeue { job_id } => {
                let job = service.requeue_dead(&job_id).await?;
                println!("死信作业已重新排队: {} ({})", job.job_id, job.job_type);
            }
        },
        Commands::Workers => {
            let workers = service.list_workers(Utc::now()).await?;
            if as_json {
                println!("{}", serde_json::to_string_pretty(&workers)?);
            } else {
                print_workers_table(&workers);
            }
        }
        Commands::Queues => {
            for (job_type, depth) in service.queue_depths().await? {
                println!("{:<12} {}", job_type, depth);
            }
        }
        Commands::Config(config_cmd) => handle_config_commands(&config_cmd, config_path)?,
    }

    Ok(())
}

// 配置命令处理
fn handle_config_commands(config_cmd: &ConfigCommands, config_path: Option<&str>) -> Result<()> {
    match config_cmd.action {
        ConfigActions::Show => {
            let app_config = AppConfig::load(config_path).context("加载配置文件失败")?;
            println!("{}", app_config.to_toml()?);
        }
        ConfigActions::Validate => match AppConfig::load(config_path) {
            Ok(_) => println!("✓ 配置文件验证通过"),
            Err(e) => return Err(anyhow::anyhow!("✗ 配置文件验证失败: {:#}", e)),
        },
        ConfigActions::Example => {
            println!("{}", AppConfig::default().to_toml()?);
        }
    }

    Ok(())
}

fn print_jobs_table(jobs: &[Job]) {
    println!(
        "{:<44} {:<10} {:<10} {:<6} {:<8} {:<20}",
        "ID", "类型", "状态", "进度", "尝试", "更新时间"
    );
    println!("{}", "-".repeat(104));

    for job in jobs {
        println!(
            "{:<44} {:<10} {:<10} {:<6} {:<8} {:<20}",
            job.job_id,
            job.job_type,
            job.status,
            format!("{}%", job.progress),
            format!("{}/{}", job.attempt, job.max_attempts),
            job.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_job_details(job: &Job) -> Result<()> {
    println!("作业详情:");
    println!("  ID: {}", job.job_id);
    println!("  类型: {}", job.job_type);
    println!("  状态: {}", job.status);
    println!("  进度: {}%", job.progress);
    println!("  消息: {}", job.message);
    println!("  尝试: {}/{}", job.attempt, job.max_attempts);
    if job.has_owner() {
        println!("  执行Worker: {}", job.owner_worker_id);
    }
    println!("  创建时间: {}", job.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  更新时间: {}", job.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  载荷: {}", serde_json::to_string_pretty(&job.payload)?);
    Ok(())
}

fn print_dlq_table(entries: &[DeadLetterEntry]) {
    println!("{:<44} {:<10} {:<6} {:<20} {}", "ID", "类型", "尝试", "进入时间", "原因");
    println!("{}", "-".repeat(110));

    for entry in entries {
        println!(
            "{:<44} {:<10} {:<6} {:<20} {}",
            entry.job_id,
            entry.job_type,
            entry.attempts,
            entry.dead_at.format("%Y-%m-%d %H:%M:%S"),
            entry.reason
        );
    }
}

fn print_workers_table(workers: &[WorkerView]) {
    println!(
        "{:<28} {:<6} {:<20} {:<8} {:<10} {:<8} {}",
        "Worker ID", "存活", "最后心跳", "CPU%", "内存MB", "已处理", "当前作业"
    );
    println!("{}", "-".repeat(110));

    for worker in workers {
        let hb = &worker.heartbeat;
        println!(
            "{:<28} {:<6} {:<20} {:<8.1} {:<10.1} {:<8} {}",
            hb.worker_id,
            if worker.alive { "是" } else { "否" },
            hb.last_seen.format("%Y-%m-%d %H:%M:%S"),
            hb.cpu_percent,
            hb.memory_mb,
            hb.jobs_processed,
            hb.current_job_id.as_deref().unwrap_or("-")
        );
    }
}
