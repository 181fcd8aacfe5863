//! Request builders for every call kind.
//!
//! Prompt wording lives here and nowhere else; the rest of the crate only
//! sees [`ChatRequest`]s.

use serde::{Deserialize, Serialize};

use crate::levels::LevelDefinition;
use crate::plans::{PLAN_END, PLAN_START};
use crate::providers::{ChatMessage, ChatRequest};
use crate::session::{ChatEntry, JudgeVerdict, Sender};

pub const PLANS_TEMPERATURE: f32 = 1.3;
pub const ACTOR_TEMPERATURE: f32 = 1.2;
pub const MONOLOGUE_TEMPERATURE: f32 = 1.3;
pub const JUDGE_TEMPERATURE: f32 = 0.2;
pub const COMBINED_TEMPERATURE: f32 = 1.3;

/// A chat message to reply to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineInput {
    /// Who sent it (boss, relative, ex...).
    pub role: String,
    /// What the user wants out of the exchange.
    pub intent: String,
    /// Relationship closeness, 0..=10.
    pub score: u8,
    pub text: String,
}

/// An in-person situation to script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineInput {
    pub scenario: String,
    pub role: Option<String>,
    pub who: Option<String>,
    pub intent: Option<String>,
    pub supplement: Option<String>,
}

/// Map chat history onto model roles. System entries stay local.
pub fn history_messages(history: &[ChatEntry]) -> Vec<ChatMessage> {
    history
        .iter()
        .filter_map(|entry| match entry.sender {
            Sender::Ai => Some(ChatMessage::assistant(entry.text.as_str())),
            Sender::User => Some(ChatMessage::user(entry.text.as_str())),
            Sender::System => None,
        })
        .collect()
}

fn with_history(system: String, history: &[ChatEntry]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system)];
    messages.extend(history_messages(history));
    messages
}

fn last_user_text(history: &[ChatEntry]) -> &str {
    history
        .iter()
        .rev()
        .find(|e| e.sender == Sender::User)
        .map(|e| e.text.as_str())
        .unwrap_or("")
}

// ---------------------------------------------------------------------------
// Plan generation
// ---------------------------------------------------------------------------

pub fn online_plans(input: &OnlineInput) -> ChatRequest {
    let system = format!(
        "你是一位深谙中国式人情世故的“社交师爷”，任务是模拟微信聊天回复。\n\
         要求：\n\
         1. 懂潜台词、面子文化与利益拉扯，回复要滴水不漏。\n\
         2. 每个方案随机给出 1 到 3 句回复，模拟真实的打字节奏。\n\
         3. 心法一针见血，点出人性弱点或底层逻辑。\n\
         输出格式（纯文本，不要 JSON），依次给出 Plan A、Plan B、Plan C：\n\
         {PLAN_START}\n\
         【标题】Plan A: [四字流派]\n\
         【心法】[心理博弈分析]\n\
         【回复】[第一条气泡]\n\
         【回复】[第二条气泡 (可选)]\n\
         {PLAN_END}"
    );
    let user = format!(
        "对方身份：{}\n意图：{}\n关系分(0-10)：{}\n对方原话：{}",
        input.role,
        input.intent,
        input.score.min(10),
        input.text
    );
    ChatRequest::streaming(
        vec![ChatMessage::system(system), ChatMessage::user(user)],
        PLANS_TEMPERATURE,
    )
}

pub fn offline_plans(input: &OfflineInput) -> ChatRequest {
    let mut context = format!("场景：{}\n", input.scenario);
    for (label, value) in [
        ("我的角色/处境", &input.role),
        ("关键人物/对象", &input.who),
        ("我的核心意图/诉求", &input.intent),
    ] {
        if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
            context.push_str(&format!("{label}：{v}\n"));
        }
    }
    let supplement = input.supplement.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or("无");
    context.push_str(&format!("补充说明：{supplement}\n"));

    let system = format!(
        "你是一位久经沙场的社交“老炮儿”。请根据场景、局势和目标，生成 2 个行动锦囊。\n\
         {context}\
         要求：\n\
         1. 把策略拆成 3~6 个具体步骤，涉及沟通的步骤写出能照着念的话术。\n\
         2. 心法写透局势与雷区，50-100 字，可用 **加粗** 强调。\n\
         3. 每个步骤配一个 Emoji 图标，标签按实际情况起名。\n\
         严格输出格式（不要代码块）：\n\
         {PLAN_START}\n\
         【标题】Plan A: [3-5字流派名]\n\
         【心法】[局势分析]\n\
         【步骤】[👀] 关键词 - [具体动作 + 具体话术]\n\
         {PLAN_END}"
    );
    ChatRequest::streaming(
        vec![ChatMessage::system(system), ChatMessage::user("请生成应对方案。")],
        PLANS_TEMPERATURE,
    )
}

// ---------------------------------------------------------------------------
// Arena channels
// ---------------------------------------------------------------------------

fn persona(level: &LevelDefinition) -> String {
    format!(
        "【微信聊天角色扮演】\n你扮演：{}\n背景：{}\n绝对禁止描写物理动作，禁止替玩家说话。\n",
        level.opponent_name, level.background
    )
}

/// Speculative in-character reply, streamed inside an envelope whose header
/// carries the actor's own mood guess and inner thoughts.
pub fn actor(level: &LevelDefinition, history: &[ChatEntry], last_mood: i32) -> ChatRequest {
    let system = format!(
        "{}你当前的心情值：{last_mood}（0-100）。\n\
         先输出数据，后输出回复，格式如下：\n\
         ###DATA###\n\
         {{\"mood\": <新心情值>, \"innerOS\": \"<此刻的真实心理活动>\"}}\n\
         ###TEXT###\n\
         [气泡1]|||[气泡2]|||[气泡3]\n\
         回复必须用 \"|||\" 分成 1 到 3 句，除台词外不要输出任何内容。",
        persona(level)
    );
    ChatRequest::streaming(with_history(system, history), ACTOR_TEMPERATURE)
}

pub fn monologue(level: &LevelDefinition, history: &[ChatEntry]) -> ChatRequest {
    let system = format!(
        "{}玩家的目标是：{}\n\
         请根据对话写出你此刻一针见血的一句内心独白。只输出这句话本身，\
         不加前缀或格式，不要写玩家的想法。",
        persona(level),
        level.user_context
    );
    ChatRequest::streaming(with_history(system, history), MONOLOGUE_TEMPERATURE)
}

/// One-shot JSON verdict for the turn that just ended.
pub fn judge(level: &LevelDefinition, history: &[ChatEntry], last_mood: i32) -> ChatRequest {
    let system = format!(
        "【裁决指令】你要为角色 {} 的心情和本局结果做出裁决。\n\
         角色背景：{}\n\
         玩家最新回复：\"{}\"\n\
         上一轮好感度：{last_mood}\n\
         胜利条件：【{}】\n\
         失败条件：玩家妥协，或新好感度低于 10。\n\
         好感度机制：说话得体 +1~2 分；冒犯 -20~30 分。\n\
         只输出一个 JSON 对象：\n\
         {{\"mood\": <新好感度>, \"isGameOver\": <true/false>, \"isWin\": <true/false>, \
         \"analysis\": \"<50-80 字的老道复盘>\", \"funnyReaction\": \"<一句幽默的对方最终行动>\"}}",
        level.opponent_name,
        level.background,
        last_user_text(history),
        level.victory_condition
    );
    ChatRequest::one_shot_json(
        vec![
            ChatMessage::system(system),
            ChatMessage::user("请根据以上信息进行裁决并输出JSON。"),
        ],
        JUDGE_TEMPERATURE,
    )
}

fn verdict_note(verdict: &JudgeVerdict) -> String {
    let result = if verdict.is_win { "玩家胜利" } else { "玩家失败" };
    format!(
        "【裁决已出】本局结束，{result}。你的最终心情值：{}。裁判点评：{}\n\
         你的下一句话必须与这个结局一致。",
        verdict.mood, verdict.analysis
    )
}

/// Closing lines that agree with a game-over verdict.
pub fn final_actor(
    level: &LevelDefinition,
    history: &[ChatEntry],
    verdict: &JudgeVerdict,
) -> ChatRequest {
    let mut request = actor(level, history, verdict.mood);
    request.messages.push(ChatMessage::system(verdict_note(verdict)));
    request
}

pub fn final_monologue(
    level: &LevelDefinition,
    history: &[ChatEntry],
    verdict: &JudgeVerdict,
) -> ChatRequest {
    let mut request = monologue(level, history);
    request.messages.push(ChatMessage::system(verdict_note(verdict)));
    request
}

/// Single-call turn: the envelope header carries the whole verdict.
pub fn combined_turn(
    level: &LevelDefinition,
    history: &[ChatEntry],
    last_mood: i32,
) -> ChatRequest {
    let system = format!(
        "{}你的初始心情值：{last_mood}（0-100）。\n\
         心情机制：得体 +1~2 分；冒犯或敷衍 -20~30 分；恶劣直接归零。\n\
         玩家胜利条件：【{}】\n\
         玩家妥协或你的心情低于 10 判负；达成胜利条件且心情大于 0 判胜。\n\
         先输出数据，后输出回复：\n\
         ###DATA###\n\
         {{\"mood\": <新数值>, \"innerOS\": \"<毒舌心理活动>\", \"isGameOver\": <true/false>, \
         \"isWin\": <true/false>, \"score\": <0-100>, \"analysis\": \"<简短分析>\"}}\n\
         ###TEXT###\n\
         [气泡1]|||[气泡2]|||[气泡3]",
        persona(level),
        level.victory_condition
    );
    ChatRequest::streaming(with_history(system, history), COMBINED_TEMPERATURE)
}
