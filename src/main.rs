use actix::prelude::*;
use anyhow::{Context, Result};
use gallerynet::cli;
use gallerynet::core::task::retrying::{ResponseContent, RetryOutcome};
use gallerynet::core::task::state::TaskId;
use gallerynet::ui::{print_error, print_success, FetchSummary, ProgressManager};
use gallerynet::utils::logger::{init_logger, DEFAULT_LOG_FILE};
use gallerynet::{QueueClass, TaskManager};
use log::{error, info, warn, LevelFilter};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

#[actix::main]
async fn main() -> Result<()> {
    // 解析参数和配置
    let (args, config) = cli::Args::parse_args()?;
    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    init_logger(level, Some(DEFAULT_LOG_FILE)).context("无法初始化日志")?;
    info!("程序启动 (构建于 {})", gallerynet::BUILD_TIMESTAMP);

    let urls = match args.get_urls() {
        Ok(urls) => urls,
        Err(e) => {
            error!("获取URL列表失败: {}", e);
            eprintln!("获取URL列表失败: {}", e);
            std::process::exit(1);
        }
    };

    info!("解析到的URLs: {:?}", urls);
    info!("配置文件路径: {}", args.config);
    info!("配置摘要:\n{}", config.get_summary());
    println!("{}", config.get_summary());

    std::fs::create_dir_all(&config.download_dir)
        .with_context(|| format!("无法创建下载目录: {}", config.download_dir))?;

    let manager = TaskManager::from_config(&config, Arbiter::current());
    let progress = Arc::new(ProgressManager::new());

    // 网络指示器跟随传输队列的忙闲
    let mut busy = manager.watch_network_in_use();
    let indicator = Arc::clone(&progress);
    actix_rt::spawn(async move {
        while busy.changed().await.is_ok() {
            let in_use = *busy.borrow();
            indicator.set_network_in_use(in_use);
        }
    });

    let started = Instant::now();
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, RetryOutcome)>();
    let mut task_ids: Vec<TaskId> = Vec::new();

    for (index, url) in urls.iter().enumerate() {
        let request = match manager.request_to_get(url) {
            Ok(request) => request,
            Err(e) => {
                print_error(&format!("无效的请求: {} - {}", url, e));
                continue;
            }
        };
        let file_name = extract_filename_from_url(url, index);
        let file_path = Path::new(&config.download_dir).join(&file_name);

        let task = manager
            .retrying_transfer(request)
            .with_acceptable_content_types(config.content_types())
            .with_response_file_path(&file_path);

        let bar = progress.add_transfer(&file_name).await;
        let mut status = task.status();
        let bars = Arc::clone(&progress);
        actix_rt::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow();
                bars.update_status(bar, current).await;
            }
        });

        let tx = tx.clone();
        let handle = manager.submit(task, QueueClass::Management, Arbiter::current(), move |outcome| {
            let _ = tx.send((bar, outcome));
        });
        info!("[task {}] 创建获取任务: {} -> {}", handle.id(), url, file_path.display());
        task_ids.push(handle.id());
    }
    drop(tx);

    if task_ids.is_empty() {
        eprintln!("没有可获取的任务");
        return Ok(());
    }

    let mut summary = FetchSummary {
        total_files: task_ids.len(),
        total_size: 0,
        elapsed_time: Default::default(),
        success_count: 0,
        failed_count: 0,
        retried_count: 0,
    };

    let mut pending = task_ids.len();
    while pending > 0 {
        tokio::select! {
            finished = rx.recv() => {
                let Some((bar, outcome)) = finished else { break };
                pending -= 1;
                if outcome.retry_count > 0 {
                    summary.retried_count += 1;
                }
                match outcome.result {
                    Ok(response) => {
                        let size = match &response.content {
                            ResponseContent::Memory(bytes) => bytes.len() as u64,
                            ResponseContent::File(path) => std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
                        };
                        summary.total_size += size;
                        summary.success_count += 1;
                        progress.finish_transfer(bar, "完成".to_string()).await;
                        info!("[task {}] 获取完成: {}", outcome.task_id, outcome.request.url);
                    }
                    Err(e) => {
                        summary.failed_count += 1;
                        progress.finish_transfer(bar, format!("失败: {}", e)).await;
                        error!("[task {}] 获取失败: {} - {}", outcome.task_id, outcome.request.url, e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("用户中断，取消剩余 {} 个任务", pending);
                for id in &task_ids {
                    manager.cancel(*id);
                }
                summary.failed_count += pending;
                break;
            }
        }
    }

    progress.finish();
    manager.shutdown();
    summary.elapsed_time = started.elapsed();

    if summary.failed_count == 0 {
        print_success("全部获取完成");
    } else {
        print_error(&format!("{} 个任务失败", summary.failed_count));
    }
    println!("{}", summary);
    info!("获取完成 - 成功: {}, 失败: {}", summary.success_count, summary.failed_count);

    Ok(())
}

/// 从URL中提取文件名
fn extract_filename_from_url(url: &str, index: usize) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if let Some(last_slash) = path.rfind('/') {
        let filename = &path[last_slash + 1..];
        if !filename.is_empty() && !path[..last_slash].ends_with('/') {
            return filename.to_string();
        }
    }

    // 如果无法从URL提取，使用默认名称
    format!("download_{}_{}", chrono::Utc::now().timestamp(), index)
}
