//! # kovi-plugin-zepi
//!
//! 群则批管理：给群友打上“则批”标记并附上外号，查看本群则批列表，
//! 以及在群聊出现联机暗号时自动 @ 全体则批。
//!
//! ## 指令
//! - `你是则批 @某人 外号`：认证则批（重复认证会更新外号）
//! - `开除则籍 @某人`：移出则批列表
//! - `则批列表`：列出本群全部则批
//!
//! ## 被动召唤
//! 群消息包含 `ymyz`（不区分大小写）或形如 `1.2.3.4:10800` 的地址时，
//! 若本群有则批，则逐一 @ 召唤。
//!
//! 数据保存在插件数据目录下的 `zepi_list.json`，配置位于 `config.toml`。

// =============================
//          Modules
// =============================

/// 配置管理
pub mod config {
    use kovi::toml;
    use kovi::utils::load_toml_data;
    use parking_lot::RwLock;
    use serde::{Deserialize, Serialize};
    use std::path::Path;
    use std::sync::Arc;

    const DEFAULT_CONFIG: &str = r#"
# 认证则批时是否必须在 @ 之后附上外号
# 关闭后未填写外号的则批记为 "未知"
require_nickname = true

# 指令词
[commands]
tag = "你是则批"
untag = "开除则籍"
list = "则批列表"

# 被动召唤
[watcher]
enabled = true
# 命中任一关键词即召唤（不区分大小写）
keywords = ["ymyz"]
# 是否匹配 IP:端口 形式的联机地址
match_ip_port = true
header = "检测到联机信号，呼叫本群全体则批："
"#;

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    pub struct CommandWords {
        pub tag: String,
        pub untag: String,
        pub list: String,
    }

    #[derive(Debug, Serialize, Deserialize, Clone)]
    pub struct WatcherConfig {
        pub enabled: bool,
        pub keywords: Vec<String>,
        pub match_ip_port: bool,
        pub header: String,
    }

    #[derive(Debug, Serialize, Deserialize, Clone)]
    pub struct Config {
        pub require_nickname: bool,
        pub commands: CommandWords,
        pub watcher: WatcherConfig,
    }

    /// 消息文本对应的指令
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Command {
        Tag,
        Untag,
        List,
    }

    impl Default for Config {
        fn default() -> Self {
            toml::from_str(DEFAULT_CONFIG).expect("built-in config is valid toml")
        }
    }

    impl Config {
        pub fn load(data_dir: &Path) -> Arc<RwLock<Self>> {
            if !data_dir.exists()
                && let Err(e) = std::fs::create_dir_all(data_dir)
            {
                log::error!("[zepi] 创建数据目录失败 {:?}: {}", data_dir, e);
            }
            let config_path = data_dir.join("config.toml");

            let default = Config::default();
            let config = load_toml_data(default.clone(), config_path).unwrap_or(default);

            Arc::new(RwLock::new(config))
        }

        /// 识别指令：认证/开除的指令词须独立成词（后面跟着 @ 和外号），列表要求整句匹配
        pub fn command_of(&self, text: &str) -> Option<Command> {
            let text = text.trim();
            let words = &self.commands;
            if text == words.list {
                Some(Command::List)
            } else if leads_with(text, &words.tag) {
                Some(Command::Tag)
            } else if leads_with(text, &words.untag) {
                Some(Command::Untag)
            } else {
                None
            }
        }
    }

    /// 指令词之后只能是空白或结尾
    fn leads_with(text: &str, word: &str) -> bool {
        !word.is_empty()
            && text
                .strip_prefix(word)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn default_config_parses() {
            let cfg = Config::default();
            assert!(cfg.require_nickname);
            assert_eq!(cfg.commands.tag, "你是则批");
            assert_eq!(cfg.watcher.keywords, vec!["ymyz".to_string()]);
            assert!(cfg.watcher.match_ip_port);
        }

        #[test]
        fn command_words_are_recognized() {
            let cfg = Config::default();
            assert_eq!(cfg.command_of("你是则批 小明"), Some(Command::Tag));
            assert_eq!(cfg.command_of("  开除则籍 "), Some(Command::Untag));
            assert_eq!(cfg.command_of("则批列表"), Some(Command::List));
            assert_eq!(cfg.command_of("则批列表在哪"), None);
            assert_eq!(cfg.command_of("今天打 ymyz 吗"), None);
        }

        #[test]
        fn command_word_must_stand_alone() {
            let cfg = Config::default();
            assert_eq!(cfg.command_of("你是则批吗"), None);
            assert_eq!(cfg.command_of("开除则籍了没"), None);
            assert_eq!(cfg.command_of("你是则批"), Some(Command::Tag));
            assert_eq!(cfg.command_of("开除则籍\n"), Some(Command::Untag));
        }
    }
}

/// 则批数据存储
pub mod store {
    use anyhow::Context;
    use indexmap::IndexMap;
    use serde::Deserialize;
    use std::collections::BTreeMap;
    use std::fmt::Display;
    use std::fs;
    use std::path::{Path, PathBuf};

    pub const DATA_FILE: &str = "zepi_list.json";

    /// 旧版数据没有外号，迁移时统一记为此值
    pub const PLACEHOLDER_NICKNAME: &str = "未知";

    /// user_id -> 外号，保持认证先后顺序
    pub type GroupTagSet = IndexMap<String, String>;

    /// 文件中单个群的两种形态
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StoredGroup {
        Tagged(GroupTagSet),
        /// 旧版：只有 QQ 号列表
        Legacy(Vec<serde_json::Value>),
    }

    /// group_id -> 则批集合，整体常驻内存，每次改动后整文件覆盖写回
    #[derive(Debug, Default)]
    pub struct TagStore {
        groups: BTreeMap<String, GroupTagSet>,
        path: PathBuf,
    }

    impl TagStore {
        /// 读取数据文件；不存在时为空，读取或解析失败时记录日志并同样返回空表
        pub fn load(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let groups = match read_groups(&path) {
                Ok(groups) => groups,
                Err(e) => {
                    log::error!("[zepi] 加载则批数据失败: {:#}", e);
                    BTreeMap::new()
                }
            };
            Self { groups, path }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// 先写临时文件再重命名覆盖
        pub fn save(&self) -> anyhow::Result<()> {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("创建目录 {:?} 失败", dir))?;
            }
            let json = serde_json::to_string_pretty(&self.groups)?;
            let tmp = self.path.with_extension("json.tmp");
            fs::write(&tmp, json).with_context(|| format!("写入 {:?} 失败", tmp))?;
            fs::rename(&tmp, &self.path)
                .with_context(|| format!("替换 {:?} 失败", self.path))?;
            Ok(())
        }

        /// 保存失败只记日志，内存中的数据保持不变
        pub fn persist(&self) {
            if let Err(e) = self.save() {
                log::error!("[zepi] 保存则批数据失败: {:#}", e);
            }
        }

        /// 认证或更新外号，返回原外号
        pub fn tag(
            &mut self,
            group: impl Display,
            user: impl Display,
            nickname: impl Into<String>,
        ) -> Option<String> {
            self.groups
                .entry(group.to_string())
                .or_default()
                .insert(user.to_string(), nickname.into())
        }

        /// 开除则籍，返回被移除的外号；群内清空后连同群一起删除
        pub fn untag(&mut self, group: impl Display, user: impl Display) -> Option<String> {
            let gid = group.to_string();
            let set = self.groups.get_mut(&gid)?;
            let removed = set.shift_remove(&user.to_string())?;
            if set.is_empty() {
                self.groups.remove(&gid);
            }
            Some(removed)
        }

        pub fn group(&self, group: impl Display) -> Option<&GroupTagSet> {
            self.groups.get(&group.to_string())
        }

        pub fn len(&self, group: impl Display) -> usize {
            self.group(group).map_or(0, |set| set.len())
        }

        /// 按存储顺序列出 (user_id, 外号)
        pub fn entries(&self, group: impl Display) -> Vec<(String, String)> {
            self.group(group)
                .map(|set| {
                    set.iter()
                        .map(|(uid, nick)| (uid.clone(), nick.clone()))
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    fn read_groups(path: &Path) -> anyhow::Result<BTreeMap<String, GroupTagSet>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(path).with_context(|| format!("读取 {:?} 失败", path))?;
        let stored: BTreeMap<String, StoredGroup> =
            serde_json::from_str(&raw).with_context(|| format!("解析 {:?} 失败", path))?;
        Ok(migrate(stored))
    }

    fn migrate(stored: BTreeMap<String, StoredGroup>) -> BTreeMap<String, GroupTagSet> {
        stored
            .into_iter()
            .map(|(gid, group)| {
                let set = match group {
                    StoredGroup::Tagged(set) => set,
                    StoredGroup::Legacy(ids) => {
                        log::info!("[zepi] 迁移旧版数据: 群 {} 共 {} 人", gid, ids.len());
                        ids.into_iter()
                            .filter_map(|id| match legacy_user_id(&id) {
                                Some(uid) => Some((uid, PLACEHOLDER_NICKNAME.to_string())),
                                None => {
                                    log::warn!("[zepi] 群 {} 跳过无法识别的 QQ 号: {}", gid, id);
                                    None
                                }
                            })
                            .collect()
                    }
                };
                (gid, set)
            })
            .collect()
    }

    /// 只接受整数或纯数字字符串
    fn legacy_user_id(id: &serde_json::Value) -> Option<String> {
        match id {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(|v| v.to_string())
                .or_else(|| n.as_u64().map(|v| v.to_string())),
            serde_json::Value::String(s) => {
                let s = s.trim();
                (!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())).then(|| s.to_string())
            }
            _ => None,
        }
    }

}

/// 从消息段中解析被 @ 的用户与外号
pub mod mention {
    use kovi::bot::message::Segment;
    use serde_json::Value;

    /// 统一后的消息段
    #[derive(Debug, Clone, PartialEq)]
    pub enum Part<'a> {
        /// `None` 表示 @全体成员 或无法识别的 QQ 号
        At(Option<i64>),
        Text(&'a str),
        Other,
    }

    /// 各种消息段表示只需实现一次此转换
    pub trait AsPart {
        fn as_part(&self) -> Part<'_>;
    }

    impl<T: AsPart + ?Sized> AsPart for &T {
        fn as_part(&self) -> Part<'_> {
            (**self).as_part()
        }
    }

    impl AsPart for Part<'_> {
        fn as_part(&self) -> Part<'_> {
            self.clone()
        }
    }

    impl AsPart for Segment {
        fn as_part(&self) -> Part<'_> {
            classify(&self.type_, Some(&self.data))
        }
    }

    /// OneBot 原始 JSON：`{"type": "at", "data": {"qq": "123"}}`
    impl AsPart for Value {
        fn as_part(&self) -> Part<'_> {
            match self.get("type").and_then(Value::as_str) {
                Some(kind) => classify(kind, self.get("data")),
                None => Part::Other,
            }
        }
    }

    fn classify<'a>(kind: &str, data: Option<&'a Value>) -> Part<'a> {
        match kind {
            "at" => Part::At(data.and_then(|d| d.get("qq")).and_then(user_id)),
            "text" => data
                .and_then(|d| d.get("text"))
                .and_then(Value::as_str)
                .map_or(Part::Other, Part::Text),
            _ => Part::Other,
        }
    }

    /// qq 字段可能是字符串也可能是数字
    fn user_id(qq: &Value) -> Option<i64> {
        let id = match qq {
            Value::String(s) if s == "all" => None,
            Value::String(s) => s.trim().parse().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        };
        id.filter(|id| *id != 0)
    }

    /// 第一个被 @ 的用户（跳过 @全体成员）
    pub fn mentioned_user<I>(segments: I) -> Option<i64>
    where
        I: IntoIterator,
        I::Item: AsPart,
    {
        segments.into_iter().find_map(|seg| match seg.as_part() {
            Part::At(id) => id,
            _ => None,
        })
    }

    /// 第一个被 @ 的用户，以及其后所有文本拼接并去除首尾空白的外号。
    /// 没有 @ 时返回 `None`；有 @ 但没有后续文本时外号为空串。
    pub fn mention_with_nickname<I>(segments: I) -> Option<(i64, String)>
    where
        I: IntoIterator,
        I::Item: AsPart,
    {
        let mut target = None;
        let mut nickname = String::new();
        for seg in segments {
            match (seg.as_part(), target) {
                (Part::At(Some(id)), None) => target = Some(id),
                (Part::Text(text), Some(_)) => nickname.push_str(text),
                _ => {}
            }
        }
        target.map(|id| (id, nickname.trim().to_string()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn nickname_follows_first_mention() {
            let parts = [Part::Text("hi"), Part::At(Some(123)), Part::Text(" coolname ")];
            assert_eq!(
                mention_with_nickname(&parts),
                Some((123, "coolname".to_string()))
            );
        }

        #[test]
        fn text_before_mention_is_ignored() {
            let parts = [
                Part::Text("你是则批 "),
                Part::At(Some(7)),
                Part::Text(" 小"),
                Part::Other,
                Part::Text("七 "),
            ];
            assert_eq!(mention_with_nickname(&parts), Some((7, "小七".to_string())));
        }

        #[test]
        fn later_mentions_do_not_replace_first() {
            let parts = [Part::At(Some(1)), Part::Text("甲"), Part::At(Some(2))];
            assert_eq!(mentioned_user(&parts), Some(1));
            assert_eq!(mention_with_nickname(&parts), Some((1, "甲".to_string())));
        }

        #[test]
        fn mention_without_text_has_empty_nickname() {
            let parts = [Part::Text("开除则籍 "), Part::At(Some(5))];
            assert_eq!(mention_with_nickname(&parts), Some((5, String::new())));
        }

        #[test]
        fn no_mention_yields_none() {
            let parts = [Part::Text("你是则批 谁")];
            assert_eq!(mentioned_user(&parts), None);
            assert_eq!(mention_with_nickname(&parts), None);
        }

        #[test]
        fn raw_json_segments_skip_at_all() {
            let segs = vec![
                json!({"type": "at", "data": {"qq": "all"}}),
                json!({"type": "at", "data": {"qq": 42}}),
                json!({"type": "text", "data": {"text": "  老四 "}}),
            ];
            assert_eq!(mentioned_user(&segs), Some(42));
            assert_eq!(mention_with_nickname(&segs), Some((42, "老四".to_string())));
        }

        #[test]
        fn malformed_json_segments_are_other() {
            assert_eq!(json!({"data": {"qq": "1"}}).as_part(), Part::Other);
            assert_eq!(json!({"type": "at"}).as_part(), Part::At(None));
            assert_eq!(
                json!({"type": "at", "data": {"qq": "abc"}}).as_part(),
                Part::At(None)
            );
            assert_eq!(json!({"type": "image", "data": {}}).as_part(), Part::Other);
        }

        #[test]
        fn kovi_segments_are_adapted() {
            let segs = vec![
                Segment::new("text", json!({"text": "你是则批 "})),
                Segment::new("at", json!({"qq": "10001"})),
                Segment::new("text", json!({"text": " 马化腾"})),
            ];
            assert_eq!(
                mention_with_nickname(segs.iter()),
                Some((10001, "马化腾".to_string()))
            );
        }
    }
}

/// 指令处理
pub mod commands {
    use super::config::Config;
    use super::mention::{AsPart, mention_with_nickname, mentioned_user};
    use super::store::{PLACEHOLDER_NICKNAME, TagStore};
    use kovi::bot::message::{Message, Segment};
    use parking_lot::RwLock;
    use serde_json::json;

    pub const NOT_IN_GROUP: &str = "请在群聊中使用此指令。";

    /// 回复内容，由插件入口转换为 Kovi 消息
    #[derive(Debug, Clone, PartialEq)]
    pub enum Reply {
        Text(String),
        /// 标题 + 逐个 @ 的 (user_id, 外号)
        Roll {
            header: String,
            entries: Vec<(String, String)>,
        },
    }

    impl Reply {
        /// 列表形式为：标题行，之后每位则批一行 `@某人 (外号)`
        pub fn into_message(self) -> Message {
            match self {
                Reply::Text(text) => Message::new().add_text(text),
                Reply::Roll { header, entries } => {
                    let last = entries.len().saturating_sub(1);
                    let mut segs = vec![Segment::new(
                        "text",
                        json!({ "text": format!("{}\n", header) }),
                    )];
                    for (i, (uid, nick)) in entries.into_iter().enumerate() {
                        let tail = if i == last { "" } else { "\n" };
                        segs.push(Segment::new("at", json!({ "qq": uid })));
                        segs.push(Segment::new(
                            "text",
                            json!({ "text": format!(" ({}){}", nick, tail) }),
                        ));
                    }
                    Message::from(segs)
                }
            }
        }
    }

    fn text(s: impl Into<String>) -> Reply {
        Reply::Text(s.into())
    }

    /// 你是则批 @某人 外号
    pub fn tag<I>(store: &RwLock<TagStore>, cfg: &Config, group: Option<i64>, segments: I) -> Reply
    where
        I: IntoIterator,
        I::Item: AsPart,
    {
        let Some(group_id) = group else {
            return text(NOT_IN_GROUP);
        };

        let Some((target, nickname)) = mention_with_nickname(segments) else {
            return text(format!(
                "请 @ 一名用户将其认证为则批，例如：{} @某人 外号",
                cfg.commands.tag
            ));
        };

        let nickname = if !nickname.is_empty() {
            nickname
        } else if cfg.require_nickname {
            return text(format!(
                "请在 @ 之后附上外号，例如：{} @某人 外号",
                cfg.commands.tag
            ));
        } else {
            PLACEHOLDER_NICKNAME.to_string()
        };

        let mut store = store.write();
        let previous = store.tag(group_id, target, nickname.as_str());
        store.persist();
        log::info!("[zepi] 群 {} 认证则批 {}({})", group_id, nickname, target);

        match previous {
            Some(old) if old != nickname => text(format!(
                "该用户已经是公认的则批了，外号已由 {} 更新为 {}。",
                old, nickname
            )),
            Some(_) => text("该用户已经是公认的则批了，无需重复认证。"),
            None => text(format!(
                "认证成功！已将 {}({}) 加入本群则批豪华午餐。",
                nickname, target
            )),
        }
    }

    /// 开除则籍 @某人
    pub fn untag<I>(store: &RwLock<TagStore>, group: Option<i64>, segments: I) -> Reply
    where
        I: IntoIterator,
        I::Item: AsPart,
    {
        let Some(group_id) = group else {
            return text(NOT_IN_GROUP);
        };

        let Some(target) = mentioned_user(segments) else {
            return text("请 @ 一名用户以开除其则籍。");
        };

        let mut store = store.write();
        let Some(nickname) = store.untag(group_id, target) else {
            return text("该用户不在本群的则批列表中。");
        };
        store.persist();
        log::info!("[zepi] 群 {} 开除则籍 {}({})", group_id, nickname, target);

        text(format!("操作成功！已将 {}({}) 开除则籍。", nickname, target))
    }

    /// 则批列表
    pub fn list(store: &RwLock<TagStore>, group: Option<i64>) -> Reply {
        let Some(group_id) = group else {
            return text(NOT_IN_GROUP);
        };

        let entries = store.read().entries(group_id);
        if entries.is_empty() {
            return text("本群目前还没有认证的则批。");
        }

        Reply::Roll {
            header: format!("本群共有 {} 位则批：", entries.len()),
            entries,
        }
    }

}

/// 被动召唤
pub mod watcher {
    use super::commands::Reply;
    use super::config::WatcherConfig;
    use super::store::TagStore;
    use parking_lot::RwLock;
    use regex::Regex;
    use std::sync::OnceLock;

    static RE_IP_PORT: OnceLock<Regex> = OnceLock::new();

    /// 关键词（不区分大小写）或 IP:端口
    pub fn triggered(cfg: &WatcherConfig, text: &str) -> bool {
        let lower = text.to_lowercase();
        if cfg
            .keywords
            .iter()
            .any(|kw| !kw.is_empty() && lower.contains(&kw.to_lowercase()))
        {
            return true;
        }
        cfg.match_ip_port
            && RE_IP_PORT
                .get_or_init(|| Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d{1,5}").unwrap())
                .is_match(text)
    }

    /// 命中且本群有则批时返回召唤消息，否则保持沉默
    pub fn watch(
        store: &RwLock<TagStore>,
        cfg: &WatcherConfig,
        group: Option<i64>,
        text: &str,
    ) -> Option<Reply> {
        let group_id = group?;
        if !cfg.enabled || !triggered(cfg, text) {
            return None;
        }
        let entries = store.read().entries(group_id);
        if entries.is_empty() {
            return None;
        }
        Some(Reply::Roll {
            header: cfg.header.clone(),
            entries,
        })
    }

}

// =============================
//      Main Plugin Logic
// =============================

use config::Command;
use kovi::PluginBuilder;
use parking_lot::RwLock;
use std::sync::Arc;

#[kovi::plugin]
async fn main() {
    let bot = PluginBuilder::get_runtime_bot();
    let data_dir = bot.get_data_path();

    let config_lock = config::Config::load(&data_dir);
    let store = Arc::new(RwLock::new(store::TagStore::load(
        data_dir.join(store::DATA_FILE),
    )));

    log::info!(
        "[zepi] 则批管理插件已加载，数据路径: {}",
        store.read().path().display()
    );

    let store_msg = store.clone();
    PluginBuilder::on_msg(move |event| {
        let store = store_msg.clone();
        let config_lock = config_lock.clone();

        async move {
            let text = match event.borrow_text() {
                Some(t) => t,
                None => return,
            };

            // 快速读取配置，立即释放锁
            let cfg = config_lock.read().clone();
            let group_id = event.group_id;

            let reply = match cfg.command_of(text) {
                Some(Command::Tag) => Some(commands::tag(
                    &store,
                    &cfg,
                    group_id,
                    event.message.iter(),
                )),
                Some(Command::Untag) => {
                    Some(commands::untag(&store, group_id, event.message.iter()))
                }
                Some(Command::List) => Some(commands::list(&store, group_id)),
                None => None,
            };
            if let Some(reply) = reply {
                event.reply(reply.into_message());
            }

            if let Some(call) = watcher::watch(&store, &cfg.watcher, group_id, text) {
                event.reply(call.into_message());
            }
        }
    });

    PluginBuilder::drop(move || {
        let store = store.clone();
        async move {
            store.read().persist();
        }
    });
}
