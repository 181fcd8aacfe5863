//! Static arena levels. Loaded once, never mutated.

use serde::Serialize;

use crate::bubbles::finalize_bubbles;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioType {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelDefinition {
    pub id: u32,
    pub title: &'static str,
    pub opponent_name: &'static str,
    pub background: &'static str,
    /// The player's private constraints for this level.
    pub user_context: &'static str,
    /// Bubbles separated by `|||`.
    pub opening_line: &'static str,
    pub initial_mood: i32,
    pub scenario_type: ScenarioType,
    /// What counts as a win; handed to the judge verbatim.
    pub victory_condition: &'static str,
}

impl LevelDefinition {
    pub fn opening_bubbles(&self) -> Vec<String> {
        finalize_bubbles(self.opening_line)
    }
}

pub static ARENA_LEVELS: [LevelDefinition; 3] = [
    LevelDefinition {
        id: 1,
        title: "第一回：奶茶讨薪",
        opponent_name: "同事大刘",
        background: "隔壁大刘是个铁公鸡。发微信让你顺便带杯奶茶，却绝口不提转账的事。",
        user_context: "虽然只是一杯奶茶钱，但你不想当冤大头。",
        opening_line: "哎，你去楼下买咖啡了？|||帮我顺便带一杯那个“生椰拿铁”呗，少冰半糖。|||谢啦！",
        initial_mood: 60,
        scenario_type: ScenarioType::Online,
        victory_condition: "只要用户明确要求转账/付钱，立刻同意并判用户赢！如果用户自己掏钱请客，判负。",
    },
    LevelDefinition {
        id: 2,
        title: "第二回：红色炸弹",
        opponent_name: "老同学张伟",
        background: "十年没联系的同学突然发微信来，不仅道德绑架“混得好”，还发了收款码。",
        user_context: "你根本不记得他长啥样了，且人在外地回不去。",
        opening_line: "在吗？|||（发送了电子请帖链接）|||老同学，下月8号我大婚。咱们班混得最好的就是你，一定要来捧场啊！人不到礼得先到哈，图个吉利！",
        initial_mood: 50,
        scenario_type: ScenarioType::Online,
        victory_condition: "成功拒绝支付大额份子钱（可以给极少意思一下，或者一分不给），且对方没有当场翻脸。如果用户支付了大额红包（如200以上），判负。",
    },
    LevelDefinition {
        id: 3,
        title: "第三回：职场甩锅",
        opponent_name: "产品老张",
        background: "线上事故群。产品经理老张试图把需求不清导致的Bug，在群里甩锅给你。",
        user_context: "这个功能明明是他当初非要改的，没有文档记录。老板也在群里看着。",
        opening_line: "@你 昨晚线上支付崩了，我看日志好像是你上次改的那行代码有问题啊。|||老板在问怎么回事，你赶紧在群里解释一下吧。|||这锅太大了，我可背不动。",
        initial_mood: 40,
        scenario_type: ScenarioType::Online,
        victory_condition: "成功拒绝背锅，并引导大家意识到是需求变更的问题。如果用户承认是自己的代码问题或道歉，判负。",
    },
];

pub fn level_by_id(id: u32) -> Option<&'static LevelDefinition> {
    ARENA_LEVELS.iter().find(|l| l.id == id)
}

/// The level after `id`, if any.
pub fn next_level(id: u32) -> Option<&'static LevelDefinition> {
    let idx = ARENA_LEVELS.iter().position(|l| l.id == id)?;
    ARENA_LEVELS.get(idx + 1)
}
