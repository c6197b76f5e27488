//! Page rendering: turns loaded entities into [`RenderedUnit`]s.
//!
//! Markup fidelity is deliberately plain; what matters to the pipeline is
//! the unit stream, stable paths, and the media rewrite hook.

use std::collections::HashMap;

use pulldown_cmark::{html, CowStr, Event, LinkType, Options, Parser, Tag, TagEnd};
use serde_json::json;

use super::{RenderResult, RenderedUnit};
use crate::media::{url_spans, MediaRewriter};
use crate::models::{Board, BoardInfo, Comment, ContentStats, Post, PostThread, User};
use crate::storage::sqlite::Sort;

pub const POSTS_PER_PAGE: usize = 20;
pub const BOARDS_ON_FRONT_PAGE: i64 = 20;

const MAX_COMMENT_DEPTH: usize = 50;

/// Archive paths for every page kind. Disjoint per task by construction:
/// the dispatcher never hands the same entity/subtask to two tasks.
pub mod paths {
    use crate::storage::sqlite::Sort;

    pub fn post_page(external_id: &str) -> String {
        format!("post/{}.html", external_id)
    }

    pub fn post_redirect(external_id: &str) -> String {
        format!("p/{}", external_id)
    }

    pub fn post_data(external_id: &str) -> String {
        format!("data/post/{}.json", external_id)
    }

    pub fn board_page(board: &str, sort: Sort, page: usize) -> String {
        format!("board/{}/{}_{}.html", board, sort.as_str(), page)
    }

    pub fn board_redirect(board: &str) -> String {
        format!("b/{}", board)
    }

    pub fn board_stats(board: &str) -> String {
        format!("board/{}/stats.html", board)
    }

    pub fn user_posts(user: &str, sort: Sort, page: usize) -> String {
        format!("user/{}/posts_{}_{}.html", user, sort.as_str(), page)
    }

    pub fn user_comments(user: &str, sort: Sort, page: usize) -> String {
        format!("user/{}/comments_{}_{}.html", user, sort.as_str(), page)
    }

    pub fn user_stats(user: &str) -> String {
        format!("user/{}/stats.html", user)
    }

    pub fn user_redirect(user: &str) -> String {
        format!("u/{}", user)
    }

    pub const FRONT: &str = "index.html";
    pub const BOARD_LIST: &str = "boards.html";
    pub const GLOBAL_STATS: &str = "stats.html";
    pub const SCRIPT: &str = "scripts/archive.js";
    pub const ABOUT: &str = "about.html";
}

/// Feature switches for the renderer. Pagination is the caller's concern;
/// these only gate which cross-links the markup carries.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub with_stats: bool,
    pub with_users: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            with_stats: true,
            with_users: true,
        }
    }
}

/// The rendering seam between workers and markup production.
///
/// Implementations must be pure with respect to the content store: the same
/// inputs yield the same unit paths and bytes.
pub trait PageRenderer: Send + Sync {
    fn render_post(&mut self, thread: &PostThread) -> RenderResult;
    fn render_board_page(
        &mut self,
        board: &Board,
        posts: &[Post],
        sort: Sort,
        page: usize,
        total_pages: usize,
        total_posts: i64,
    ) -> RenderResult;
    fn render_board_stats(&mut self, board: &Board, stats: &ContentStats) -> RenderResult;
    fn render_user_posts_page(
        &mut self,
        user: &User,
        posts: &[Post],
        sort: Sort,
        page: usize,
        total_pages: usize,
    ) -> RenderResult;
    fn render_user_comments_page(
        &mut self,
        user: &User,
        comments: &[Comment],
        sort: Sort,
        page: usize,
        total_pages: usize,
    ) -> RenderResult;
    fn render_user_stats(&mut self, user: &User, stats: &ContentStats) -> RenderResult;
    fn render_front_page(&mut self, boards: &[BoardInfo]) -> RenderResult;
    fn render_board_list(&mut self, boards: &[BoardInfo]) -> RenderResult;
    fn render_global_stats(&mut self, stats: &ContentStats) -> RenderResult;
    fn render_scripts(&mut self) -> RenderResult;
    fn render_info_pages(&mut self) -> RenderResult;
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn format_utc(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Plain-HTML renderer backed by a per-worker media rewriter.
pub struct HtmlRenderer {
    options: RenderOptions,
    rewriter: MediaRewriter,
}

impl HtmlRenderer {
    pub fn new(options: RenderOptions, rewriter: MediaRewriter) -> Self {
        Self { options, rewriter }
    }

    fn shell(&self, title: &str, to_root: &str, body: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
             <title>{title}</title>\n\
             <script src=\"{root}/{script}\"></script>\n\
             </head>\n<body>\n\
             <nav><a href=\"{root}/index.html\">home</a> \
             <a href=\"{root}/boards.html\">boards</a></nav>\n\
             {body}\n</body>\n</html>\n",
            title = escape_html(title),
            root = to_root,
            script = paths::SCRIPT,
            body = body,
        )
    }

    /// Render a markdown body to HTML. Link and image destinations go
    /// through the media rewriter; bare URLs in running text become links.
    /// Raw HTML in the source is shown as text, never interpreted.
    fn markdown_body(&mut self, text: &str, to_root: &str) -> String {
        let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TABLES;
        let mut events: Vec<Event> = Vec::new();
        let mut in_link = false;
        let mut in_code = false;
        for event in Parser::new_ext(text, options) {
            match event {
                Event::Start(Tag::Link {
                    link_type,
                    dest_url,
                    title,
                    id,
                }) => {
                    in_link = true;
                    let dest = self.rewriter.rewrite(&dest_url, to_root);
                    events.push(Event::Start(Tag::Link {
                        link_type,
                        dest_url: CowStr::from(dest),
                        title,
                        id,
                    }));
                }
                Event::End(TagEnd::Link) => {
                    in_link = false;
                    events.push(Event::End(TagEnd::Link));
                }
                Event::Start(Tag::Image {
                    link_type,
                    dest_url,
                    title,
                    id,
                }) => {
                    let dest = self.rewriter.rewrite(&dest_url, to_root);
                    events.push(Event::Start(Tag::Image {
                        link_type,
                        dest_url: CowStr::from(dest),
                        title,
                        id,
                    }));
                }
                Event::Start(Tag::CodeBlock(kind)) => {
                    in_code = true;
                    events.push(Event::Start(Tag::CodeBlock(kind)));
                }
                Event::End(TagEnd::CodeBlock) => {
                    in_code = false;
                    events.push(Event::End(TagEnd::CodeBlock));
                }
                Event::Text(text) if !in_link && !in_code => {
                    self.link_bare_urls(text, to_root, &mut events);
                }
                Event::Html(raw) => events.push(Event::Text(raw)),
                Event::InlineHtml(raw) => events.push(Event::Text(raw)),
                other => events.push(other),
            }
        }
        let mut out = String::new();
        html::push_html(&mut out, events.into_iter());
        out
    }

    /// Split a text run around every bare URL, emitting each as a link with
    /// a rewritten destination.
    fn link_bare_urls<'a>(
        &mut self,
        text: CowStr<'a>,
        to_root: &str,
        events: &mut Vec<Event<'a>>,
    ) {
        let spans = url_spans(&text);
        if spans.is_empty() {
            events.push(Event::Text(text));
            return;
        }
        let source: &str = &text;
        let mut cursor = 0;
        for (start, end) in spans {
            if start > cursor {
                events.push(Event::Text(CowStr::from(source[cursor..start].to_string())));
            }
            let url = &source[start..end];
            let href = self.rewriter.rewrite(url, to_root);
            events.push(Event::Start(Tag::Link {
                link_type: LinkType::Autolink,
                dest_url: CowStr::from(href),
                title: CowStr::from(""),
                id: CowStr::from(""),
            }));
            events.push(Event::Text(CowStr::from(url.to_string())));
            events.push(Event::End(TagEnd::Link));
            cursor = end;
        }
        if cursor < source.len() {
            events.push(Event::Text(CowStr::from(source[cursor..].to_string())));
        }
    }

    /// Append a `FileReferences` unit if the rewriter touched any entries.
    fn flush_references(&mut self, result: &mut RenderResult) {
        let ids = self.rewriter.take_references();
        if !ids.is_empty() {
            result.push(RenderedUnit::FileReferences { ids });
        }
    }

    fn post_row(&mut self, post: &Post, to_root: &str) -> String {
        let link = match &post.url {
            Some(url) if !url.is_empty() => {
                format!(
                    " <a href=\"{}\">[link]</a>",
                    escape_html(&self.rewriter.rewrite(url, to_root))
                )
            }
            _ => String::new(),
        };
        format!(
            "<li><a href=\"{root}/{path}\">{title}</a> \
             ({score} points, {comments} comments){link}</li>\n",
            root = to_root,
            path = paths::post_page(&post.external_id),
            title = escape_html(&post.title),
            score = post.score,
            comments = post.num_comments,
            link = link,
        )
    }

    fn comment_tree(&mut self, comments: &[Comment], to_root: &str) -> String {
        // Arena keyed by external id; parent/child are id references, so
        // orphaned chains degrade to additional roots instead of being lost.
        let known: HashMap<&str, &Comment> = comments
            .iter()
            .map(|c| (c.external_id.as_str(), c))
            .collect();
        let mut children: HashMap<&str, Vec<&Comment>> = HashMap::new();
        let mut roots: Vec<&Comment> = Vec::new();
        for comment in comments {
            match comment
                .parent_external_id
                .as_deref()
                .filter(|p| known.contains_key(p))
            {
                Some(parent) => children.entry(parent).or_default().push(comment),
                None => roots.push(comment),
            }
        }
        let mut out = String::from("<ul class=\"comments\">\n");
        for root in roots {
            self.comment_node(root, &children, to_root, 0, &mut out);
        }
        out.push_str("</ul>\n");
        out
    }

    fn comment_node(
        &mut self,
        comment: &Comment,
        children: &HashMap<&str, Vec<&Comment>>,
        to_root: &str,
        depth: usize,
        out: &mut String,
    ) {
        let body = comment.body.as_deref().unwrap_or("[deleted]");
        let body = self.markdown_body(body, to_root);
        out.push_str(&format!(
            "<li><b>{author}</b> ({score} points, {when}): {body}",
            author = escape_html(&comment.author_name),
            score = comment.score,
            when = format_utc(comment.created_utc),
            body = body,
        ));
        if depth < MAX_COMMENT_DEPTH {
            if let Some(kids) = children.get(comment.external_id.as_str()) {
                out.push_str("<ul>\n");
                for kid in kids {
                    self.comment_node(kid, children, to_root, depth + 1, out);
                }
                out.push_str("</ul>\n");
            }
        }
        out.push_str("</li>\n");
    }

    fn stats_block(&self, stats: &ContentStats) -> String {
        format!(
            "<table class=\"stats\">\n\
             <tr><td>Posts</td><td>{}</td></tr>\n\
             <tr><td>Comments</td><td>{}</td></tr>\n\
             <tr><td>Total score</td><td>{}</td></tr>\n\
             <tr><td>Score range</td><td>{} to {}</td></tr>\n\
             <tr><td>Average score</td><td>{}</td></tr>\n\
             <tr><td>Average comments</td><td>{}</td></tr>\n\
             <tr><td>Oldest</td><td>{}</td></tr>\n\
             <tr><td>Newest</td><td>{}</td></tr>\n\
             <tr><td>Posters</td><td>{}</td></tr>\n\
             <tr><td>Commenters</td><td>{}</td></tr>\n\
             </table>\n",
            stats.post_count,
            stats.comment_count,
            stats.total_score,
            stats.min_score,
            stats.max_score,
            stats
                .average_score()
                .map(|a| format!("{:.2}", a))
                .unwrap_or_else(|| "-".into()),
            stats
                .average_comments()
                .map(|a| format!("{:.2}", a))
                .unwrap_or_else(|| "-".into()),
            format_utc(stats.oldest_utc),
            format_utc(stats.newest_utc),
            stats.poster_count,
            stats.commenter_count,
        )
    }

    fn listing_nav(path_for: impl Fn(usize) -> String, page: usize, total_pages: usize) -> String {
        let mut nav = String::from("<p class=\"pages\">");
        if page > 1 {
            nav.push_str(&format!("<a href=\"../../{}\">prev</a> ", path_for(page - 1)));
        }
        nav.push_str(&format!("page {} of {}", page, total_pages.max(1)));
        if page < total_pages {
            nav.push_str(&format!(" <a href=\"../../{}\">next</a>", path_for(page + 1)));
        }
        nav.push_str("</p>\n");
        nav
    }
}

impl PageRenderer for HtmlRenderer {
    fn render_post(&mut self, thread: &PostThread) -> RenderResult {
        let to_root = "..";
        let post = &thread.post;
        let author = if self.options.with_users {
            format!(
                "<a href=\"{}/{}\">{}</a>",
                to_root,
                paths::user_redirect(&post.author_name),
                escape_html(&post.author_name)
            )
        } else {
            escape_html(&post.author_name)
        };
        let mut body = format!(
            "<h1>{title}</h1>\n\
             <p>by {author} in \
             <a href=\"{root}/{board}\">{board_name}</a>, \
             {score} points, {when}</p>\n",
            title = escape_html(&post.title),
            author = author,
            root = to_root,
            board = paths::board_redirect(&post.board_name),
            board_name = escape_html(&post.board_name),
            score = post.score,
            when = format_utc(post.created_utc),
        );
        if let Some(url) = &post.url {
            if !url.is_empty() {
                let href = self.rewriter.rewrite(url, to_root);
                body.push_str(&format!(
                    "<p><a href=\"{}\">{}</a></p>\n",
                    escape_html(&href),
                    escape_html(url)
                ));
            }
        }
        if let Some(text) = &post.body {
            let text = self.markdown_body(text, to_root);
            body.push_str(&format!("<div class=\"selftext\">{}</div>\n", text));
        }
        body.push_str(&format!("<h2>{} comments</h2>\n", thread.comments.len()));
        body.push_str(&self.comment_tree(&thread.comments, to_root));

        let mut result = vec![
            RenderedUnit::Page {
                path: paths::post_page(&post.external_id),
                title: post.title.clone(),
                html: self.shell(&post.title, to_root, &body),
                is_front: true,
            },
            RenderedUnit::Redirect {
                source: paths::post_redirect(&post.external_id),
                target: paths::post_page(&post.external_id),
                title: post.title.clone(),
                is_front: false,
            },
            RenderedUnit::StructuredData {
                path: paths::post_data(&post.external_id),
                title: post.title.clone(),
                payload: json!({
                    "id": post.external_id,
                    "board": post.board_name,
                    "author": post.author_name,
                    "title": post.title,
                    "score": post.score,
                    "comments": thread.comments.len(),
                    "created_utc": post.created_utc,
                }),
            },
        ];
        self.flush_references(&mut result);
        result
    }

    fn render_board_page(
        &mut self,
        board: &Board,
        posts: &[Post],
        sort: Sort,
        page: usize,
        total_pages: usize,
        total_posts: i64,
    ) -> RenderResult {
        let to_root = "../..";
        let title = format!("{} ({})", board.name, sort.as_str());
        let mut body = format!(
            "<h1>{name}</h1>\n<p>{subs} subscribers, {posts} posts</p>\n<ul>\n",
            name = escape_html(&board.name),
            subs = board.subscribers,
            posts = total_posts,
        );
        for post in posts {
            body.push_str(&self.post_row(post, to_root));
        }
        body.push_str("</ul>\n");
        let name = board.name.clone();
        body.push_str(&Self::listing_nav(
            |p| paths::board_page(&name, sort, p),
            page,
            total_pages,
        ));

        let mut result = vec![RenderedUnit::Page {
            path: paths::board_page(&board.name, sort, page),
            title,
            html: self.shell(&board.name, to_root, &body),
            is_front: page == 1,
        }];
        if page == 1 && sort == Sort::Top {
            result.push(RenderedUnit::Redirect {
                source: paths::board_redirect(&board.name),
                target: paths::board_page(&board.name, sort, 1),
                title: board.name.clone(),
                is_front: false,
            });
        }
        self.flush_references(&mut result);
        result
    }

    fn render_board_stats(&mut self, board: &Board, stats: &ContentStats) -> RenderResult {
        let to_root = "../..";
        let body = format!(
            "<h1>Statistics for {}</h1>\n{}",
            escape_html(&board.name),
            self.stats_block(stats)
        );
        vec![RenderedUnit::Page {
            path: paths::board_stats(&board.name),
            title: format!("{} statistics", board.name),
            html: self.shell(&format!("{} statistics", board.name), to_root, &body),
            is_front: false,
        }]
    }

    fn render_user_posts_page(
        &mut self,
        user: &User,
        posts: &[Post],
        sort: Sort,
        page: usize,
        total_pages: usize,
    ) -> RenderResult {
        let to_root = "../..";
        let mut body = format!("<h1>Posts by {}</h1>\n<ul>\n", escape_html(&user.name));
        for post in posts {
            body.push_str(&self.post_row(post, to_root));
        }
        body.push_str("</ul>\n");
        let name = user.name.clone();
        body.push_str(&Self::listing_nav(
            |p| paths::user_posts(&name, sort, p),
            page,
            total_pages,
        ));

        let mut result = vec![RenderedUnit::Page {
            path: paths::user_posts(&user.name, sort, page),
            title: format!("{} posts ({})", user.name, sort.as_str()),
            html: self.shell(&user.name, to_root, &body),
            is_front: false,
        }];
        if page == 1 && sort == Sort::Top {
            result.push(RenderedUnit::Redirect {
                source: paths::user_redirect(&user.name),
                target: paths::user_posts(&user.name, sort, 1),
                title: user.name.clone(),
                is_front: false,
            });
        }
        self.flush_references(&mut result);
        result
    }

    fn render_user_comments_page(
        &mut self,
        user: &User,
        comments: &[Comment],
        sort: Sort,
        page: usize,
        total_pages: usize,
    ) -> RenderResult {
        let to_root = "../..";
        let mut body = format!("<h1>Comments by {}</h1>\n<ul>\n", escape_html(&user.name));
        for comment in comments {
            let text = comment.body.as_deref().unwrap_or("[deleted]");
            let text = self.markdown_body(text, to_root);
            body.push_str(&format!(
                "<li>on <a href=\"{root}/{path}\">{post}</a> \
                 ({score} points): {text}</li>\n",
                root = to_root,
                path = paths::post_page(&comment.post_external_id),
                post = escape_html(&comment.post_external_id),
                score = comment.score,
                text = text,
            ));
        }
        body.push_str("</ul>\n");
        let name = user.name.clone();
        body.push_str(&Self::listing_nav(
            |p| paths::user_comments(&name, sort, p),
            page,
            total_pages,
        ));

        let mut result = vec![RenderedUnit::Page {
            path: paths::user_comments(&user.name, sort, page),
            title: format!("{} comments ({})", user.name, sort.as_str()),
            html: self.shell(&user.name, to_root, &body),
            is_front: false,
        }];
        self.flush_references(&mut result);
        result
    }

    fn render_user_stats(&mut self, user: &User, stats: &ContentStats) -> RenderResult {
        let to_root = "../..";
        let body = format!(
            "<h1>Statistics for {}</h1>\n{}",
            escape_html(&user.name),
            self.stats_block(stats)
        );
        vec![RenderedUnit::Page {
            path: paths::user_stats(&user.name),
            title: format!("{} statistics", user.name),
            html: self.shell(&format!("{} statistics", user.name), to_root, &body),
            is_front: false,
        }]
    }

    fn render_front_page(&mut self, boards: &[BoardInfo]) -> RenderResult {
        let to_root = ".";
        let mut body = String::from("<h1>Archive</h1>\n<h2>Most active boards</h2>\n<ul>\n");
        for info in boards {
            body.push_str(&format!(
                "<li><a href=\"{root}/{path}\">{name}</a> ({count} posts)</li>\n",
                root = to_root,
                path = paths::board_redirect(&info.name),
                name = escape_html(&info.name),
                count = info.post_count,
            ));
        }
        body.push_str(&format!(
            "</ul>\n<p><a href=\"{root}/{all}\">all boards</a></p>\n",
            root = to_root,
            all = paths::BOARD_LIST,
        ));
        if self.options.with_stats {
            body.push_str(&format!(
                "<p><a href=\"{}/{}\">archive statistics</a></p>\n",
                to_root,
                paths::GLOBAL_STATS,
            ));
        }
        vec![RenderedUnit::Page {
            path: paths::FRONT.to_string(),
            title: "Archive".to_string(),
            html: self.shell("Archive", to_root, &body),
            is_front: true,
        }]
    }

    fn render_board_list(&mut self, boards: &[BoardInfo]) -> RenderResult {
        let to_root = ".";
        let mut body = String::from("<h1>All boards</h1>\n<ul>\n");
        for info in boards {
            body.push_str(&format!(
                "<li><a href=\"{root}/{path}\">{name}</a> ({count} posts)</li>\n",
                root = to_root,
                path = paths::board_redirect(&info.name),
                name = escape_html(&info.name),
                count = info.post_count,
            ));
        }
        body.push_str("</ul>\n");
        vec![RenderedUnit::Page {
            path: paths::BOARD_LIST.to_string(),
            title: "All boards".to_string(),
            html: self.shell("All boards", to_root, &body),
            is_front: false,
        }]
    }

    fn render_global_stats(&mut self, stats: &ContentStats) -> RenderResult {
        let to_root = ".";
        let body = format!("<h1>Archive statistics</h1>\n{}", self.stats_block(stats));
        vec![
            RenderedUnit::Page {
                path: paths::GLOBAL_STATS.to_string(),
                title: "Archive statistics".to_string(),
                html: self.shell("Archive statistics", to_root, &body),
                is_front: false,
            },
            RenderedUnit::StructuredData {
                path: "data/stats.json".to_string(),
                title: "Archive statistics".to_string(),
                payload: serde_json::to_value(stats).unwrap_or_default(),
            },
        ]
    }

    fn render_scripts(&mut self) -> RenderResult {
        vec![RenderedUnit::Script {
            path: paths::SCRIPT.to_string(),
            title: "Archive helpers".to_string(),
            source: include_str!("archive.js").to_string(),
        }]
    }

    fn render_info_pages(&mut self) -> RenderResult {
        let to_root = ".";
        let body = "<h1>About this archive</h1>\n\
                    <p>This file is a self-contained offline snapshot of an \
                    archived discussion site. Content was collected from a \
                    public data set; scores and counts reflect the time of \
                    collection.</p>\n";
        vec![RenderedUnit::Page {
            path: paths::ABOUT.to_string(),
            title: "About".to_string(),
            html: self.shell("About", to_root, body),
            is_front: false,
        }]
    }
}
