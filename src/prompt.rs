//! 提示词拼装：回复格式说明、表情编号表、工具列表、用户消息与定时任务包装

/// 表情名，下标即表情编号
pub const EMOTIONS: [&str; 19] = [
    "正常", "高兴", "伤心", "生气", "害怕", "惊讶", "厌恶", "羞愤", "兴奋", "担心", "调皮", "慌张", "紧张", "认真",
    "无奈", "心动", "羞耻", "自信", "疑惑",
];

/// 提示词场景
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// 用户发来消息
    Chat,
    /// 定时任务到点，由角色自己发起
    Schedule,
}

pub fn emotion_name(code: u32) -> Option<&'static str> {
    EMOTIONS.get(code as usize).copied()
}

/// `正常：0` 每行一个
pub fn emotion_table() -> String {
    EMOTIONS
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{name}：{i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn scenario_header(scenario: Scenario) -> &'static str {
    match scenario {
        Scenario::Chat => "#### 场景\n\n用户给你发送了消息，你需要按照要求进行回复\n\n",
        Scenario::Schedule => "#### 场景\n\n你之前给自己定下的任务到时间了，你需要主动开口完成它\n\n",
    }
}

/// 回复格式说明；`tools` 为空时不介绍工具
pub fn response_format(tools: &[String]) -> String {
    let mut out = String::from(
        "#### 回复格式\n\n\
         你需要输出多个 <item>，每个 item 依次包括：回复的消息（中文）、日语翻译、情绪编号，使用“|”分隔，\n\
         例如 <item>早上好呀|おはよう|1</item>。\n\
         可用的情绪与编号如下（严格只用右边的数字作为情绪输出）：\n",
    );
    out.push_str(&emotion_table());
    out.push_str("\n如果你把情绪写成文字或写出非数字，这一句不会被展示。\n\n");

    if !tools.is_empty() {
        out.push_str(
            "#### 工具调用\n\n\
             需要时可以调用工具，格式为 <tool><name>工具名</name><arguments>参数1, 参数2</arguments></tool>，\n\
             多个参数用英文逗号隔开，参数都按字符串处理。可用工具：\n",
        );
        out.push_str(&tools.join("\n"));
        out.push_str("\n只有在确实需要时才使用工具。\n\n");
    }
    out
}

/// 系统提示词：场景 + 回复格式 + 角色设定
pub fn system_prompt(scenario: Scenario, tools: &[String], character: &str) -> String {
    let mut out = String::from(scenario_header(scenario));
    out.push_str(&response_format(tools));
    let character = character.trim();
    if !character.is_empty() {
        out.push_str("#### 角色设定\n\n");
        out.push_str(character);
        out.push('\n');
    }
    out
}

pub fn wrap_user_message(text: &str) -> String {
    format!("<userMessage>{}</userMessage>", text.trim())
}

/// 调度器空闲时的自省任务：规划下一次主动聊天
pub const IDLE_REFLECTION: &str = "对方已经有一段时间没有和你互动了，想一想下一次主动找对方聊些什么吧。\
可以讲个小故事，也可以随便问点什么来增加回忆。\
用 addSchedule 定好下一次聊天的时间和话题就好，这次不需要回复任何消息。";

pub fn wrap_schedule(content: &str) -> String {
    format!(
        "现在到了你之前定下的任务时间，任务内容如下：\n<schedule>{}</schedule>\n请直接对我说出你要说的话。",
        content.trim()
    )
}
