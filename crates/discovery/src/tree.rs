use crate::config::DiscoveryConfig;
use crate::state::{DirectoryNode, DiscoveryCounters, DiscoveryState, Phase, TextFile};
use ingest_protocol::paths::{normalize_dir_path, parent_dir, path_depth, ROOT_PATH};
use ingest_protocol::{paths::file_extension, Manifest};
use std::collections::BTreeMap;

/// Build the directory tree for a manifest.
///
/// Every group directory and all of its ancestors get a node; the root always
/// exists. Text files (by extension) are attached to their directory, binaries
/// are left to other stages.
pub fn build(manifest: &Manifest, config: &DiscoveryConfig) -> DiscoveryState {
    let mut nodes: BTreeMap<String, DirectoryNode> = BTreeMap::new();
    ensure_node(&mut nodes, ROOT_PATH);

    let mut files_total = 0;
    for group in &manifest.directories {
        let path = normalize_dir_path(&group.directory_path);
        ensure_node(&mut nodes, &path);

        let text_files: Vec<TextFile> = group
            .files
            .iter()
            .filter(|file| {
                file_extension(&file.file_name).is_some_and(|ext| config.is_text_extension(&ext))
            })
            .map(|file| TextFile::new(file.file_name.clone(), file.r2_key.clone()))
            .collect();
        files_total += text_files.len();

        if let Some(node) = nodes.get_mut(&path) {
            node.text_files.extend(text_files);
        }
    }

    let current_depth = nodes.values().map(|node| node.depth).max().unwrap_or(0);
    let phase = if files_total > 0 {
        Phase::Uploading
    } else {
        Phase::Publishing
    };

    log::debug!(
        "built tree for batch {}: {} directories, {} text files, max depth {}",
        manifest.batch_id,
        nodes.len(),
        files_total,
        current_depth
    );

    DiscoveryState {
        counters: DiscoveryCounters {
            directories_total: nodes.len(),
            files_total,
            ..DiscoveryCounters::default()
        },
        nodes,
        phase,
        current_depth,
        node_entity_ids: BTreeMap::new(),
        node_tips: BTreeMap::new(),
        node_versions: BTreeMap::new(),
        parent_pi: None,
        error: None,
        retry_count: 0,
    }
}

/// Insert `path` and any missing ancestors, linking each into its parent once.
fn ensure_node(nodes: &mut BTreeMap<String, DirectoryNode>, path: &str) {
    let mut child: Option<String> = None;
    let mut current = Some(path.to_string());
    while let Some(path) = current {
        let existed = nodes.contains_key(&path);
        let node = nodes.entry(path.clone()).or_insert_with(|| {
            DirectoryNode::new(path.clone(), path_depth(&path), parent_dir(&path))
        });
        if let Some(child) = child.take() {
            node.children_paths.insert(child);
        }
        if existed {
            return;
        }
        current = node.parent_path.clone();
        child = Some(path);
    }
}
