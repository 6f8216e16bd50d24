//! Per-document tree index.
//!
//! The tree mirrors the document outline. Under a root node sit the heading
//! sections (nested by heading level); documents without headings are
//! grouped into runs of at most `max_pages_per_node` pages, and plain text
//! without pages is cut into parts. Any leaf longer than
//! `max_chars_per_node` is split further at paragraph boundaries.
//!
//! Every node carries an extractive summary (its lead sentences, then its
//! children's titles and summaries, bounded by `summary_chars`) and an
//! embedding of `title + summary`. Retrieval walks the tree with a beam
//! search and hands the chunk ids under the chosen leaves to the vector
//! index for final ranking.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::chunk::chunk_text;
use crate::config::HierarchyConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingProvider};
use crate::models::{Chunk, ExtractedContent, HierarchicalNode};

struct Draft {
    parent: Option<usize>,
    depth: u32,
    title: String,
    start: usize,
    end: usize,
}

/// Builds the tree for one document. Nodes come back parent-before-child
/// with ids `"{document_id}_node_{n}"`; embeddings are left empty.
pub fn build_tree(
    document_id: &str,
    title: &str,
    content: &ExtractedContent,
    chunks: &[Chunk],
    config: &HierarchyConfig,
) -> Vec<HierarchicalNode> {
    let text = &content.text;
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut arena = vec![Draft {
        parent: None,
        depth: 0,
        title: title.to_string(),
        start: 0,
        end: text.len(),
    }];

    if !content.headings.is_empty() {
        outline_sections(&mut arena, content);
    } else if content.pages.len() > 1 {
        page_groups(&mut arena, content, config.max_pages_per_node.max(1));
    }
    split_long_leaves(&mut arena, text, config.max_chars_per_node.max(1));

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); arena.len()];
    for (i, d) in arena.iter().enumerate() {
        if let Some(p) = d.parent {
            children[p].push(i);
        }
    }
    for kids in &mut children {
        kids.sort_by_key(|&k| arena[k].start);
    }

    // Children always sit after their parent, so a reverse pass sees every
    // child summary before the parent needs it.
    let mut summaries = vec![String::new(); arena.len()];
    for i in (0..arena.len()).rev() {
        let d = &arena[i];
        let own_end = children[i].first().map(|&c| arena[c].start).unwrap_or(d.end);
        let kids: Vec<(&str, &str)> = children[i]
            .iter()
            .map(|&c| (arena[c].title.as_str(), summaries[c].as_str()))
            .collect();
        summaries[i] = summarize(&text[d.start..own_end], &kids, config.summary_chars);
    }

    let mut ordinals = vec![0u32; arena.len()];
    for kids in &children {
        for (n, &k) in kids.iter().enumerate() {
            ordinals[k] = n as u32;
        }
    }

    arena
        .iter()
        .enumerate()
        .map(|(i, d)| HierarchicalNode {
            id: node_id(document_id, i),
            document_id: document_id.to_string(),
            parent_id: d.parent.map(|p| node_id(document_id, p)),
            level: d.depth,
            ordinal: ordinals[i],
            title: d.title.clone(),
            summary: std::mem::take(&mut summaries[i]),
            start: d.start,
            end: d.end,
            page_start: content.page_at(d.start),
            page_end: content.page_at(d.end.saturating_sub(1).max(d.start)),
            chunk_ids: chunks
                .iter()
                .filter(|c| c.start < d.end && c.end > d.start)
                .map(|c| c.id.clone())
                .collect(),
            embedding: Vec::new(),
        })
        .collect()
}

fn node_id(document_id: &str, n: usize) -> String {
    format!("{}_node_{}", document_id, n)
}

fn outline_sections(arena: &mut Vec<Draft>, content: &ExtractedContent) {
    let text = &content.text;
    let mut headings = content.headings.clone();
    headings.sort_by_key(|h| h.offset);

    if let Some(first) = headings.first() {
        if !text[..first.offset].trim().is_empty() {
            arena.push(Draft {
                parent: Some(0),
                depth: 1,
                title: "Preamble".to_string(),
                start: 0,
                end: first.offset,
            });
        }
    }

    // (arena index, heading level); the root acts as level 0.
    let mut stack: Vec<(usize, u32)> = vec![(0, 0)];
    for h in &headings {
        let level = h.level.max(1);
        while let Some(&(idx, lvl)) = stack.last() {
            if lvl < level {
                break;
            }
            arena[idx].end = h.offset;
            stack.pop();
        }
        let parent = stack.last().map(|&(idx, _)| idx).unwrap_or(0);
        let depth = arena[parent].depth + 1;
        arena.push(Draft {
            parent: Some(parent),
            depth,
            title: h.title.clone(),
            start: h.offset,
            end: text.len(),
        });
        stack.push((arena.len() - 1, level));
    }
}

fn page_groups(arena: &mut Vec<Draft>, content: &ExtractedContent, per_node: usize) {
    for group in content.pages.chunks(per_node) {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let title = if first.number == last.number {
            format!("Page {}", first.number)
        } else {
            format!("Pages {}-{}", first.number, last.number)
        };
        arena.push(Draft {
            parent: Some(0),
            depth: 1,
            title,
            start: first.start,
            end: last.end,
        });
    }
}

fn split_long_leaves(arena: &mut Vec<Draft>, text: &str, max_chars: usize) {
    let has_children: Vec<bool> = {
        let mut v = vec![false; arena.len()];
        for d in arena.iter() {
            if let Some(p) = d.parent {
                v[p] = true;
            }
        }
        v
    };

    for i in 0..has_children.len() {
        let (start, end) = (arena[i].start, arena[i].end);
        if has_children[i] || end - start <= max_chars {
            continue;
        }
        let parts = chunk_text("", &text[start..end], (max_chars / 4).max(1), 0);
        if parts.len() < 2 {
            continue;
        }
        let depth = arena[i].depth + 1;
        let base = arena[i].title.clone();
        for (n, part) in parts.iter().enumerate() {
            arena.push(Draft {
                parent: Some(i),
                depth,
                title: format!("{} (part {})", base, n + 1),
                start: start + part.start,
                end: start + part.end,
            });
        }
    }
}

/// Lead sentences of `own_text`, then child titles, then child summaries,
/// never longer than `max_chars` bytes.
pub fn summarize(own_text: &str, children: &[(&str, &str)], max_chars: usize) -> String {
    let prose: Vec<&str> = own_text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('|'))
        .collect();
    let prose = prose.join(" ");

    let mut summary = String::new();
    for sentence in sentences(&prose) {
        if !push_bounded(&mut summary, sentence, max_chars) {
            break;
        }
    }

    if !children.is_empty() {
        let titles: Vec<&str> = children.iter().map(|(t, _)| *t).collect();
        push_bounded(&mut summary, &format!("Covers: {}.", titles.join("; ")), max_chars);
        for (_, child_summary) in children {
            if let Some(first) = sentences(child_summary).next() {
                if !push_bounded(&mut summary, first, max_chars) {
                    break;
                }
            }
        }
    }

    if summary.is_empty() {
        summary = truncate_words(&prose, max_chars);
    }
    summary
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Appends `piece` if it fits. Returns whether it did.
fn push_bounded(out: &mut String, piece: &str, max_chars: usize) -> bool {
    let extra = if out.is_empty() { piece.len() } else { piece.len() + 1 };
    if out.len() + extra > max_chars {
        return false;
    }
    if !out.is_empty() {
        out.push(' ');
    }
    out.push_str(piece);
    true
}

fn truncate_words(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let mut cut = max_chars;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let head = &text[..cut];
    match head.rfind(' ') {
        Some(pos) if pos > 0 => head[..pos].to_string(),
        _ => head.to_string(),
    }
}

/// Text embedded for a node.
pub fn node_embedding_text(node: &HierarchicalNode) -> String {
    format!("{}\n{}", node.title, node.summary)
}

/// Fills `embedding` on every node, `batch_size` nodes per call.
pub async fn embed_nodes(
    nodes: &mut [HierarchicalNode],
    embedder: &dyn EmbeddingProvider,
    batch_size: usize,
) -> Result<()> {
    for batch in nodes.chunks_mut(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(node_embedding_text).collect();
        let vectors = embedder.embed(&texts).await?;
        if vectors.len() != batch.len() {
            anyhow::bail!(
                "Embedding response has {} vectors for {} tree nodes",
                vectors.len(),
                batch.len()
            );
        }
        for (node, vector) in batch.iter_mut().zip(vectors) {
            node.embedding = vector;
        }
    }
    Ok(())
}

/// Walks from the roots toward the leaves, keeping the `beam_width` most
/// query-similar nodes per level. Returns the leaves reached, best first.
pub fn beam_search<'a>(
    nodes: &'a [HierarchicalNode],
    query: &[f32],
    beam_width: usize,
) -> Vec<(&'a HierarchicalNode, f32)> {
    let mut children: HashMap<&str, Vec<&HierarchicalNode>> = HashMap::new();
    let mut roots = Vec::new();
    for node in nodes {
        match &node.parent_id {
            Some(p) => children.entry(p.as_str()).or_default().push(node),
            None => roots.push(node),
        }
    }

    let score = |n: &HierarchicalNode| cosine_similarity(query, &n.embedding);
    let by_score = |a: &(&HierarchicalNode, f32), b: &(&HierarchicalNode, f32)| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    };

    let mut frontier: Vec<(&HierarchicalNode, f32)> = roots.into_iter().map(|n| (n, score(n))).collect();
    let mut leaves = Vec::new();

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for (node, s) in frontier {
            match children.get(node.id.as_str()) {
                Some(kids) if !kids.is_empty() => {
                    next.extend(kids.iter().map(|k| (*k, score(k))));
                }
                _ => leaves.push((node, s)),
            }
        }
        next.sort_by(by_score);
        next.truncate(beam_width.max(1));
        frontier = next;
    }

    leaves.sort_by(by_score);
    leaves
}

// ============ Storage ============

/// Replaces a document's tree in one transaction.
pub async fn save_tree(pool: &SqlitePool, document_id: &str, nodes: &[HierarchicalNode]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM tree_nodes WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for node in nodes {
        sqlx::query(
            "INSERT INTO tree_nodes (id, document_id, parent_id, level, ordinal, title, summary,
                start_offset, end_offset, page_start, page_end, chunk_ids_json, embedding)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&node.id)
        .bind(&node.document_id)
        .bind(&node.parent_id)
        .bind(node.level as i64)
        .bind(node.ordinal as i64)
        .bind(&node.title)
        .bind(&node.summary)
        .bind(node.start as i64)
        .bind(node.end as i64)
        .bind(node.page_start.map(|p| p as i64))
        .bind(node.page_end.map(|p| p as i64))
        .bind(serde_json::to_string(&node.chunk_ids)?)
        .bind(vec_to_blob(&node.embedding))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Loads trees, optionally restricted to some documents.
pub async fn load_nodes(pool: &SqlitePool, document_ids: Option<&[String]>) -> Result<Vec<HierarchicalNode>> {
    let rows = match document_ids {
        Some(ids) => {
            let mut qb = sqlx::QueryBuilder::new("SELECT * FROM tree_nodes WHERE document_id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.clone());
            }
            sep.push_unseparated(") ORDER BY document_id, start_offset, level");
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            qb.build().fetch_all(pool).await?
        }
        None => {
            sqlx::query("SELECT * FROM tree_nodes ORDER BY document_id, start_offset, level")
                .fetch_all(pool)
                .await?
        }
    };

    let mut nodes = Vec::with_capacity(rows.len());
    for row in rows {
        let chunk_ids_json: String = row.get("chunk_ids_json");
        let blob: Vec<u8> = row.get("embedding");
        nodes.push(HierarchicalNode {
            id: row.get("id"),
            document_id: row.get("document_id"),
            parent_id: row.get("parent_id"),
            level: row.get::<i64, _>("level") as u32,
            ordinal: row.get::<i64, _>("ordinal") as u32,
            title: row.get("title"),
            summary: row.get("summary"),
            start: row.get::<i64, _>("start_offset") as usize,
            end: row.get::<i64, _>("end_offset") as usize,
            page_start: row.get::<Option<i64>, _>("page_start").map(|p| p as u32),
            page_end: row.get::<Option<i64>, _>("page_end").map(|p| p as u32),
            chunk_ids: serde_json::from_str(&chunk_ids_json)?,
            embedding: blob_to_vec(&blob),
        });
    }
    Ok(nodes)
}

pub async fn delete_tree(pool: &SqlitePool, document_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM tree_nodes WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_content;
    use crate::embedding::HashProvider;
    use crate::models::{Heading, PageSpan};

    fn config() -> HierarchyConfig {
        HierarchyConfig {
            max_chars_per_node: 2000,
            summary_chars: 200,
            ..HierarchyConfig::default()
        }
    }

    fn outlined() -> ExtractedContent {
        let text = "Intro words before any heading.\n\n\
                    # Animals\n\nNotes about animals.\n\n\
                    ## Zebras\n\nZebras have stripes. They live in herds.\n\n\
                    ## Lions\n\nLions hunt at night.\n\n\
                    # Plants\n\nFerns grow in shade.";
        let headings = ["# Animals", "## Zebras", "## Lions", "# Plants"]
            .iter()
            .map(|h| Heading {
                level: h.chars().take_while(|c| *c == '#').count() as u32,
                title: h.trim_start_matches('#').trim().to_string(),
                offset: text.find(h).unwrap(),
            })
            .collect();
        ExtractedContent {
            text: text.to_string(),
            headings,
            ..Default::default()
        }
    }

    #[test]
    fn headings_nest_by_level() {
        let content = outlined();
        let nodes = build_tree("d", "doc.md", &content, &[], &config());
        let titles: Vec<_> = nodes.iter().map(|n| (n.level, n.title.as_str())).collect();
        assert_eq!(
            titles,
            vec![
                (0, "doc.md"),
                (1, "Preamble"),
                (1, "Animals"),
                (2, "Zebras"),
                (2, "Lions"),
                (1, "Plants"),
            ]
        );
        let zebras = &nodes[3];
        assert_eq!(zebras.parent_id.as_deref(), Some("d_node_2"));
        assert_eq!(zebras.ordinal, 0);
        assert_eq!(nodes[4].ordinal, 1);
        assert!(content.text[zebras.start..zebras.end].contains("herds"));
        assert!(!content.text[zebras.start..zebras.end].contains("Lions"));
        assert_eq!(nodes[2].end, nodes[5].start);
    }

    #[test]
    fn summaries_are_extractive_and_bounded() {
        let nodes = build_tree("d", "doc.md", &outlined(), &[], &config());
        let zebras = &nodes[3];
        assert_eq!(zebras.summary, "Zebras have stripes. They live in herds.");
        let animals = &nodes[2];
        assert!(animals.summary.starts_with("Notes about animals."));
        assert!(animals.summary.contains("Covers: Zebras; Lions."));
        for n in &nodes {
            assert!(n.summary.len() <= 200);
        }

        let tight = summarize("One. Two. Three.", &[], 9);
        assert_eq!(tight, "One. Two.");
    }

    #[test]
    fn pages_are_grouped_without_headings() {
        let mut text = String::new();
        let mut pages = Vec::new();
        for n in 1..=25u32 {
            let start = text.len();
            text.push_str(&format!("Page {} content sentence.\n\n", n));
            pages.push(PageSpan { number: n, start, end: text.len() });
        }
        let content = ExtractedContent { text, pages, ..Default::default() };
        let nodes = build_tree("d", "scan.pdf", &content, &[], &config());
        let groups: Vec<_> = nodes.iter().skip(1).map(|n| n.title.as_str()).collect();
        assert_eq!(groups, vec!["Pages 1-10", "Pages 11-20", "Pages 21-25"]);
        assert_eq!(nodes[3].page_start, Some(21));
        assert_eq!(nodes[3].page_end, Some(25));
    }

    #[test]
    fn long_leaves_are_split_and_chunks_attached() {
        let body: String = (0..200).map(|i| format!("Sentence number {}.\n\n", i)).collect();
        let content = ExtractedContent { text: body, ..Default::default() };
        let chunks = chunk_content("d", &content, 50, 10);
        let cfg = HierarchyConfig { max_chars_per_node: 1000, ..config() };
        let nodes = build_tree("d", "long.txt", &content, &chunks, &cfg);
        assert!(nodes.len() > 3);
        for leaf in nodes.iter().skip(1) {
            assert!(leaf.end - leaf.start <= 1000);
            assert!(!leaf.chunk_ids.is_empty());
        }
        assert_eq!(nodes[0].chunk_ids.len(), chunks.len());
    }

    #[test]
    fn empty_text_builds_nothing() {
        let content = ExtractedContent::default();
        assert!(build_tree("d", "x", &content, &[], &config()).is_empty());
    }

    #[tokio::test]
    async fn beam_search_descends_to_matching_leaf() {
        let mut nodes = build_tree("d", "doc.md", &outlined(), &[], &config());
        let embedder = HashProvider::new(256);
        embed_nodes(&mut nodes, &embedder, 4).await.unwrap();

        let query = embedder.embed_one("zebras stripes herds");
        let leaves = beam_search(&nodes, &query, 1);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].0.title, "Zebras");

        let wide = beam_search(&nodes, &query, 5);
        assert!(wide.len() >= 3);
        assert_eq!(wide[0].0.title, "Zebras");
    }

    #[tokio::test]
    async fn save_and_load_replace_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut cfg = crate::config::Config::minimal();
        cfg.db.path = tmp.path().join("tree.sqlite");
        let pool = crate::db::connect(&cfg).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();

        let mut nodes = build_tree("d", "doc.md", &outlined(), &[], &config());
        embed_nodes(&mut nodes, &HashProvider::new(16), 8).await.unwrap();
        save_tree(&pool, "d", &nodes).await.unwrap();
        save_tree(&pool, "d", &nodes).await.unwrap();

        let loaded = load_nodes(&pool, Some(&["d".to_string()])).await.unwrap();
        assert_eq!(loaded.len(), nodes.len());
        let zebras = loaded.iter().find(|n| n.title == "Zebras").unwrap();
        assert_eq!(zebras.embedding.len(), 16);

        delete_tree(&pool, "d").await.unwrap();
        assert!(load_nodes(&pool, None).await.unwrap().is_empty());
    }
}
