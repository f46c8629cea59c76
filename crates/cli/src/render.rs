use ingest_discovery::DiscoveryState;
use ingest_protocol::paths::ROOT_PATH;
use serde::Serialize;

/// JSON shape of `ingest tree --json`.
#[derive(Debug, Serialize)]
pub struct TreeNodeView {
    pub path: String,
    pub depth: usize,
    pub text_files: Vec<String>,
    pub children: Vec<TreeNodeView>,
}

pub fn tree_view(state: &DiscoveryState) -> Option<TreeNodeView> {
    node_view(state, ROOT_PATH)
}

fn node_view(state: &DiscoveryState, path: &str) -> Option<TreeNodeView> {
    let node = state.nodes.get(path)?;
    Some(TreeNodeView {
        path: node.path.clone(),
        depth: node.depth,
        text_files: node
            .text_files
            .iter()
            .map(|file| file.filename.clone())
            .collect(),
        children: node
            .children_paths
            .iter()
            .filter_map(|child| node_view(state, child))
            .collect(),
    })
}

/// Box-drawing listing of the directory tree, one line per directory.
pub fn tree_text(state: &DiscoveryState) -> String {
    let mut out = String::new();
    if let Some(root) = tree_view(state) {
        out.push_str(&format!("{}{}\n", root.path, file_suffix(&root.text_files)));
        write_children(&root.children, "", &mut out);
    }
    out.push_str(&format!(
        "\n{} directories, {} text files\n",
        state.counters.directories_total, state.counters.files_total
    ));
    out
}

fn write_children(children: &[TreeNodeView], prefix: &str, out: &mut String) {
    for (idx, child) in children.iter().enumerate() {
        let last = idx + 1 == children.len();
        let (branch, indent) = if last {
            ("└── ", "    ")
        } else {
            ("├── ", "│   ")
        };
        let name = child.path.rsplit('/').next().unwrap_or(&child.path);
        out.push_str(&format!(
            "{prefix}{branch}{name}{}\n",
            file_suffix(&child.text_files)
        ));
        write_children(&child.children, &format!("{prefix}{indent}"), out);
    }
}

fn file_suffix(files: &[String]) -> String {
    match files.len() {
        0 => String::new(),
        1 => " (1 text file)".to_string(),
        n => format!(" ({n} text files)"),
    }
}
