//! Pool layout flags shared by `plan` and `run`

use std::path::PathBuf;

use clap::Args;
use mosaic_memory::config::{DEFAULT_SHRINK_THRESHOLD, EngineConfig, PoolLayout, parse_size};
use mosaic_memory::{PageSize, PoolKind};
use serde_json::{Value, json};

fn size_arg(value: &str) -> Result<usize, String> {
    parse_size(value).map_err(|error| error.to_string())
}

/// Sizes and offsets accept plain byte counts or a KB/MB/GB suffix.
#[derive(Args, Debug, Clone)]
pub struct LayoutArgs {
    /// Size of the anonymous mapping pool
    #[arg(long, default_value = "16GB", value_parser = size_arg)]
    pub anon_pool_size: usize,
    /// Start offset of the anonymous 2MB window
    #[arg(long, default_value = "0", value_parser = size_arg)]
    pub anon_start_2mb: usize,
    /// End offset of the anonymous 2MB window
    #[arg(long, default_value = "0", value_parser = size_arg)]
    pub anon_end_2mb: usize,
    /// Start offset of the anonymous 1GB window
    #[arg(long, default_value = "0", value_parser = size_arg)]
    pub anon_start_1gb: usize,
    /// End offset of the anonymous 1GB window
    #[arg(long, default_value = "0", value_parser = size_arg)]
    pub anon_end_1gb: usize,
    /// Free-list capacity of the anonymous pool, in entries
    #[arg(long, default_value = "1MB", value_parser = size_arg)]
    pub anon_list_size: usize,

    /// Size of the break pool
    #[arg(long, default_value = "16GB", value_parser = size_arg)]
    pub brk_pool_size: usize,
    /// Start offset of the break 2MB window
    #[arg(long, default_value = "0", value_parser = size_arg)]
    pub brk_start_2mb: usize,
    /// End offset of the break 2MB window
    #[arg(long, default_value = "0", value_parser = size_arg)]
    pub brk_end_2mb: usize,
    /// Start offset of the break 1GB window
    #[arg(long, default_value = "0", value_parser = size_arg)]
    pub brk_start_1gb: usize,
    /// End offset of the break 1GB window
    #[arg(long, default_value = "0", value_parser = size_arg)]
    pub brk_end_1gb: usize,

    /// Size of the file mapping pool
    #[arg(long, default_value = "1GB", value_parser = size_arg)]
    pub file_pool_size: usize,
    /// Free-list capacity of the file mapping pool, in entries
    #[arg(long, default_value = "10KB", value_parser = size_arg)]
    pub file_list_size: usize,

    /// Write pool usage reports
    #[arg(short = 'z', long)]
    pub analyze: bool,
    /// Committed bytes above the highest allocation tolerated before shrinking
    #[arg(long, default_value_t = DEFAULT_SHRINK_THRESHOLD, value_parser = size_arg)]
    pub shrink_threshold: usize,
    /// Directory usage reports are written to
    #[arg(long, default_value = ".")]
    pub report_dir: PathBuf,
}

impl LayoutArgs {
    pub fn to_config(&self, verbose_level: u64) -> EngineConfig {
        let anonymous = PoolLayout::new(self.anon_pool_size)
            .with_large_window(self.anon_start_1gb, self.anon_end_1gb)
            .with_medium_window(self.anon_start_2mb, self.anon_end_2mb)
            .with_free_list_capacity(self.anon_list_size);
        let brk = PoolLayout::new(self.brk_pool_size)
            .with_large_window(self.brk_start_1gb, self.brk_end_1gb)
            .with_medium_window(self.brk_start_2mb, self.brk_end_2mb);
        let file_backed =
            PoolLayout::new(self.file_pool_size).with_free_list_capacity(self.file_list_size);

        EngineConfig {
            analyze_pools: self.analyze,
            verbose_level,
            shrink_threshold: self.shrink_threshold,
            report_dir: self.report_dir.clone(),
            ..EngineConfig::new(brk, anonymous, file_backed)
        }
    }
}

/// Huge pages of `page_size` a configuration needs reserved.
///
/// One page per pool window plus one spare, which lets a pool pad its
/// reservation to align the window.
pub fn required_pages(config: &EngineConfig, page_size: PageSize) -> usize {
    let pages: usize = PoolKind::ALL
        .into_iter()
        .flat_map(|kind| config.pool(kind).to_region_layout().windows())
        .filter(|&(_, _, page)| page == page_size)
        .map(|(start, end, _)| (end - start) / page_size.bytes())
        .sum();
    if pages == 0 { 0 } else { pages + 1 }
}

/// Human-readable page plan of every pool
pub fn render_plan(config: &EngineConfig) -> String {
    let mut out = String::new();
    for kind in PoolKind::ALL {
        let layout = config.pool(kind);
        out.push_str(&format!(
            "{kind}: {}\n",
            mosaic_memory::utils::format_bytes(layout.pool_size)
        ));
        let mut windows: Vec<_> = layout.to_region_layout().windows().collect();
        windows.sort_by_key(|&(start, _, _)| start);
        if windows.is_empty() {
            out.push_str("  base pages only\n");
        }
        for (start, end, page) in windows {
            out.push_str(&format!(
                "  [{start:#x}, {end:#x}) {page} x{}\n",
                (end - start) / page.bytes()
            ));
        }
    }
    for page in [PageSize::HugeMedium, PageSize::HugeLarge] {
        out.push_str(&format!(
            "{page} pages to reserve: {}\n",
            required_pages(config, page)
        ));
    }
    out
}

/// JSON page plan of every pool
pub fn plan_json(config: &EngineConfig) -> Value {
    json!({
        "config": config,
        "reserve": {
            "2MB": required_pages(config, PageSize::HugeMedium),
            "1GB": required_pages(config, PageSize::HugeLarge),
        },
    })
}
