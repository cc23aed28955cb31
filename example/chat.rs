//! minimal bevy chat window over bevy_unillm.
//! - scrollable column of bubbles: user on the right, assistant on the left.
//! - the assistant bubble grows as deltas stream in.
//! - type and press enter to send; input is ignored while a reply streams.
//!
//! configuration comes from the environment:
//! `OPENAI_API_KEY`, `LLM_BASE_URL`, `LLM_MODEL`, `LLM_SYSTEM_PROMPT`.

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_unillm::{
    ChatCompletedEvt, ChatDeltaEvt, ChatOrchestrator, LlmSet, Role, UniLlmPlugin, UserMessageEvt,
    send_user_text,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct MessageList;
#[derive(Component)]
struct MessageScroll;
#[derive(Component)]
struct PromptText;
#[derive(Component)]
struct HeaderText;

// text entity of the assistant bubble currently receiving deltas
#[derive(Component)]
struct StreamingBubble;

#[derive(Resource, Default)]
struct PromptBuf(String);

const USER_BG: Color = Color::srgb(0.54, 0.17, 0.89);
const ASSISTANT_BG: Color = Color::WHITE;
const MAX_PROMPT_CHARS: usize = 1000;

// ---------------------- main ----------------------

fn main() {
    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(240, 240, 245)))
        .insert_resource(PromptBuf::default())
        .add_plugins(DefaultPlugins.set(WindowPlugin {
            primary_window: Some(Window {
                title: "UniLLM".into(),
                resolution: (400.0, 600.0).into(),
                ..default()
            }),
            ..default()
        }))
        .add_plugins(UniLlmPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, (handle_text_input, refresh_prompt_text).chain())
        // event readers should run after bevy_unillm emits events
        .add_systems(
            Update,
            (on_user_message, on_delta, on_done, scroll_to_bottom)
                .chain()
                .after(LlmSet::Drain),
        )
        .run();
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands, chat: Res<ChatOrchestrator>) {
    commands.spawn(Camera2d);

    let header = format!("model: {}", chat.config().model);

    commands
        .spawn(Node {
            width: Val::Percent(100.0),
            height: Val::Percent(100.0),
            flex_direction: FlexDirection::Column,
            ..default()
        })
        .with_children(|root| {
            root.spawn((
                Text::new(header),
                TextFont { font_size: 12.0, ..default() },
                TextColor(Color::srgb_u8(120, 120, 120)),
                Node { padding: UiRect::axes(Val::Px(10.0), Val::Px(6.0)), ..default() },
                HeaderText,
            ));

            // conversation: scrolls vertically, newest at the bottom
            root.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_grow: 1.0,
                    flex_direction: FlexDirection::Column,
                    overflow: Overflow::scroll_y(),
                    ..default()
                },
                ScrollPosition::default(),
                MessageScroll,
            ))
            .with_children(|scroll| {
                scroll.spawn((
                    Node {
                        width: Val::Percent(100.0),
                        flex_direction: FlexDirection::Column,
                        row_gap: Val::Px(8.0),
                        padding: UiRect::all(Val::Px(10.0)),
                        ..default()
                    },
                    MessageList,
                ));
            });

            // input line
            root.spawn((
                Node {
                    width: Val::Percent(100.0),
                    padding: UiRect::axes(Val::Px(15.0), Val::Px(12.0)),
                    ..default()
                },
                BackgroundColor(Color::srgb_u8(245, 245, 245)),
            ))
            .with_children(|input| {
                input.spawn((
                    Text::new("> "),
                    TextFont { font_size: 16.0, ..default() },
                    TextColor(Color::BLACK),
                    PromptText,
                ));
            });
        });
}

/// appends a bubble to the message list and returns its text entity.
fn spawn_bubble(commands: &mut Commands, list: Entity, role: Role, text: &str) -> Entity {
    let (bg, fg, align) = match role {
        Role::User => (USER_BG, Color::WHITE, AlignSelf::FlexEnd),
        _ => (ASSISTANT_BG, Color::BLACK, AlignSelf::FlexStart),
    };

    let mut text_entity = Entity::PLACEHOLDER;
    commands.entity(list).with_children(|list| {
        list.spawn((
            Node {
                max_width: Val::Percent(80.0),
                padding: UiRect::axes(Val::Px(10.0), Val::Px(8.0)),
                align_self: align,
                ..default()
            },
            BackgroundColor(bg),
            BorderRadius::all(Val::Px(12.0)),
        ))
        .with_children(|bubble| {
            text_entity = bubble
                .spawn((
                    Text::new(text),
                    TextFont { font_size: 16.0, ..default() },
                    TextColor(fg),
                ))
                .id();
        });
    });
    text_entity
}

// ---------------------- input ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    chat: Res<ChatOrchestrator>,
) {
    for ev in ev_kbd.read() {
        if !ev.state.is_pressed() {
            continue;
        }
        if let Some(txt) = &ev.text {
            let s = txt.replace(['\r', '\n'], "");
            if prompt.0.chars().count() + s.chars().count() <= MAX_PROMPT_CHARS {
                prompt.0.push_str(&s);
            }
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    // keep the draft while a reply is streaming; the plugin would drop it anyway
    if keys.just_pressed(KeyCode::Enter) && !chat.is_in_flight() && !prompt.0.trim().is_empty() {
        let msg = std::mem::take(&mut prompt.0);
        info!(target: "chat", "send (len={})", msg.len());
        send_user_text(&mut commands, msg);
    }
}

fn refresh_prompt_text(
    prompt: Res<PromptBuf>,
    chat: Res<ChatOrchestrator>,
    mut q_prompt: Query<&mut Text, With<PromptText>>,
) {
    if !prompt.is_changed() && !chat.is_changed() {
        return;
    }
    if let Ok(mut t) = q_prompt.single_mut() {
        let status = if chat.is_in_flight() { "  (replying...)" } else { "" };
        t.0 = format!("> {} |{}", prompt.0, status);
    }
}

// ---------------------- chat events ----------------------

fn on_user_message(
    mut commands: Commands,
    mut ev: EventReader<UserMessageEvt>,
    q_list: Query<Entity, With<MessageList>>,
) {
    let Ok(list) = q_list.single() else { return };
    for UserMessageEvt { message } in ev.read() {
        spawn_bubble(&mut commands, list, Role::User, &message.content);
    }
}

fn on_delta(
    mut commands: Commands,
    mut ev: EventReader<ChatDeltaEvt>,
    q_list: Query<Entity, With<MessageList>>,
    mut q_stream: Query<&mut Text, With<StreamingBubble>>,
) {
    let mut pending = String::new();
    for ChatDeltaEvt { text } in ev.read() {
        pending.push_str(text);
    }
    if pending.is_empty() {
        return;
    }

    if let Ok(mut text) = q_stream.single_mut() {
        text.0.push_str(&pending);
    } else if let Ok(list) = q_list.single() {
        // first delta of the turn opens the assistant bubble
        let entity = spawn_bubble(&mut commands, list, Role::Assistant, &pending);
        commands.entity(entity).insert(StreamingBubble);
    }
}

fn on_done(
    mut commands: Commands,
    mut ev: EventReader<ChatCompletedEvt>,
    q_list: Query<Entity, With<MessageList>>,
    mut q_stream: Query<(Entity, &mut Text), With<StreamingBubble>>,
) {
    for ChatCompletedEvt { message } in ev.read() {
        if let Ok((entity, mut text)) = q_stream.single_mut() {
            text.0.clone_from(&message.content);
            commands.entity(entity).remove::<StreamingBubble>();
        } else if let Ok(list) = q_list.single() {
            // nothing streamed: show the committed reply
            spawn_bubble(&mut commands, list, Role::Assistant, &message.content);
        }
    }
}

fn scroll_to_bottom(
    q_list: Query<&Children, (With<MessageList>, Changed<Children>)>,
    q_text: Query<(), (With<StreamingBubble>, Changed<Text>)>,
    mut q_scroll: Query<&mut ScrollPosition, With<MessageScroll>>,
) {
    if q_list.is_empty() && q_text.is_empty() {
        return;
    }
    // layout clamps this to the real content height
    if let Ok(mut pos) = q_scroll.single_mut() {
        pos.offset_y = f32::MAX;
    }
}
