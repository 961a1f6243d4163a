//! The settings menu. It shows the section of the option tree owned by
//! whichever mode attached it last, and reports changes back to that owner.

use std::path::PathBuf;

use async_trait::async_trait;
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::mono_font::ascii::FONT_6X10;
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Alignment, Baseline, Text, TextStyleBuilder};
use log::{debug, warn};

use crate::bus::{Address, ModeContext, ModeId, Payload};
use crate::frame::{Dimensions, Frame, Orientation};
use crate::input::{ControlId, InputEvent};
use crate::mode::Mode;
use crate::modes::ids;
use crate::options::{OptionKind, OptionRecord, OptionTree, OptionValue, ROOT_MENU};
use crate::overlay;

const ROW_HEIGHT: u32 = 18;
const HEADER_HEIGHT: u32 = 28;
const FOOTER_HEIGHT: u32 = 14;

pub struct Menu {
    id: ModeId,
    tree: OptionTree,
    store: Option<PathBuf>,
    owner: ModeId,
    route: Vec<String>,
    selected: usize,
    editing: Option<OptionValue>,
    display: Dimensions,
    orientation: Orientation,
    dirty: bool,
}

impl Menu {
    pub fn new(tree: OptionTree, display: Dimensions) -> Self {
        Self {
            id: ids::MENU,
            tree,
            store: None,
            owner: ids::VIEWFINDER,
            route: vec![ROOT_MENU.to_string()],
            selected: 0,
            editing: None,
            display,
            orientation: Orientation::default(),
            dirty: true,
        }
    }

    /// Saves the tree to `path` after every committed change.
    pub fn with_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = Some(path.into());
        self
    }

    pub fn tree(&self) -> &OptionTree {
        &self.tree
    }

    pub fn owner(&self) -> &ModeId {
        &self.owner
    }

    fn menu_id(&self) -> &str {
        self.route.last().map(String::as_str).unwrap_or(ROOT_MENU)
    }

    pub fn rows_per_page(&self) -> usize {
        let usable = self
            .display
            .height
            .saturating_sub(HEADER_HEIGHT + FOOTER_HEIGHT);
        (usable / ROW_HEIGHT).max(1) as usize
    }

    /// The enabled options of the current page.
    fn visible(&self) -> Vec<&OptionRecord> {
        self.tree
            .page(&self.owner, self.menu_id())
            .map(|page| page.options.iter().filter(|o| o.enabled).collect())
            .unwrap_or_default()
    }

    fn current(&self) -> Option<OptionRecord> {
        self.visible().get(self.selected).map(|o| (*o).clone())
    }

    fn move_selection(&mut self, delta: i32) {
        let len = self.visible().len() as i32;
        if len > 0 {
            self.selected = (self.selected as i32 + delta).rem_euclid(len) as usize;
        }
    }

    fn clamp_selection(&mut self) {
        let len = self.visible().len();
        if self.selected >= len {
            self.selected = len.saturating_sub(1);
        }
    }

    fn adjust(&mut self, delta: i32) {
        if let (Some(current), Some(option)) = (self.editing.take(), self.current()) {
            self.editing = Some(option.step(&current, delta));
        }
    }

    fn return_to_owner(&mut self, ctx: &mut ModeContext) {
        self.editing = None;
        ctx.request_focus(self.owner.clone());
    }

    fn back(&mut self, ctx: &mut ModeContext) {
        if self.editing.take().is_some() {
            return;
        }
        if self.route.len() > 1 {
            self.route.pop();
            self.selected = 0;
        } else {
            self.return_to_owner(ctx);
        }
    }

    async fn commit(&mut self, option: &OptionRecord, value: OptionValue, ctx: &mut ModeContext) {
        if let Err(e) = self.tree.set_value(&self.owner, &option.id, value.clone()) {
            warn!("failed to set {}: {e}", option.id);
            return;
        }
        self.clamp_selection();
        ctx.send(
            self.owner.clone(),
            Payload::Settings {
                menu_id: self.menu_id().to_string(),
                tree: self.tree.clone(),
            },
        );
        if let Some(receiver) = &option.receiver
            && *receiver != Address::Mode(self.owner.clone())
        {
            ctx.send(
                receiver.clone(),
                Payload::ApplyOption {
                    option_id: option.id.clone(),
                    value,
                },
            );
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(path) = self.store.clone() else {
            return;
        };
        let tree = self.tree.clone();
        let saved = tokio::task::spawn_blocking(move || tree.save(&path)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to save menu: {e}"),
            Err(e) => warn!("menu save task failed: {e}"),
        }
    }

    async fn select(&mut self, ctx: &mut ModeContext) {
        let Some(option) = self.current() else {
            return;
        };
        if let Some(value) = self.editing.take() {
            self.commit(&option, value, ctx).await;
            return;
        }
        match &option.kind {
            OptionKind::Bool { value } => {
                self.commit(&option, OptionValue::Bool(!value), ctx).await;
            }
            OptionKind::Numeral { .. } | OptionKind::Choice { .. } => {
                self.editing = option.value();
            }
            OptionKind::Submenu { target } => {
                if self.tree.page(&self.owner, target).is_some() {
                    self.route.push(target.clone());
                    self.selected = 0;
                } else {
                    warn!("menu page {target} of {} is missing", self.owner);
                }
            }
            OptionKind::Action { target } => ctx.request_focus(target.clone()),
            OptionKind::Message { target, payload } => {
                ctx.send(target.clone(), message_payload(payload));
                self.return_to_owner(ctx);
            }
        }
    }

    fn attach(&mut self, owner: ModeId, ctx: &mut ModeContext) {
        if self.tree.section(&owner).is_none() {
            warn!("{owner} has no menu section");
        }
        self.owner = owner;
        self.route = vec![ROOT_MENU.to_string()];
        self.selected = 0;
        self.editing = None;
        self.dirty = true;
        ctx.send(
            self.owner.clone(),
            Payload::Settings {
                menu_id: ROOT_MENU.to_string(),
                tree: self.tree.clone(),
            },
        );
    }

    fn value_text(&self, option: &OptionRecord, editing: bool) -> String {
        let value = if editing {
            self.editing.clone()
        } else {
            option.value()
        };
        let text = match (&option.kind, value) {
            (_, Some(OptionValue::Bool(true))) => "On".to_string(),
            (_, Some(OptionValue::Bool(false))) => "Off".to_string(),
            (_, Some(OptionValue::Number(n))) => format!("{n:+.1}"),
            (_, Some(OptionValue::Text(s))) => s,
            (OptionKind::Submenu { .. }, None) => ">".to_string(),
            (OptionKind::Action { .. }, None) => "->".to_string(),
            _ => String::new(),
        };
        if editing { format!("< {text} >") } else { text }
    }

    fn render(&self) -> Frame {
        let mut frame = Frame::new(self.display);
        let title = self
            .tree
            .page(&self.owner, self.menu_id())
            .map(|page| page.title.clone())
            .unwrap_or_else(|| self.owner.to_string());
        overlay::draw_header(&mut frame, &title);

        let visible = self.visible();
        if visible.is_empty() {
            let notice = overlay::notice(self.display, "No options", None);
            return super::orient(notice, self.orientation);
        }

        let rows = self.rows_per_page();
        let page = self.selected / rows;
        let pages = visible.len().div_ceil(rows);
        let width = self.display.width;
        let top = Baseline::Top;
        let left = TextStyleBuilder::new().baseline(top).build();
        let right = TextStyleBuilder::new()
            .baseline(top)
            .alignment(Alignment::Right)
            .build();

        for (row, option) in visible.iter().enumerate().skip(page * rows).take(rows) {
            let y = (HEADER_HEIGHT + (row - page * rows) as u32 * ROW_HEIGHT) as i32;
            let selected = row == self.selected;
            let editing = selected && self.editing.is_some();
            if selected {
                Rectangle::new(Point::new(0, y - 3), Size::new(width, ROW_HEIGHT))
                    .into_styled(PrimitiveStyle::with_fill(overlay::PANEL))
                    .draw(&mut frame)
                    .ok();
            }
            let label_color = if selected { overlay::ACCENT } else { Rgb888::WHITE };
            let value_color = if editing { overlay::AMBER } else { overlay::MID_GRAY };
            Text::with_text_style(
                &option.label,
                Point::new(6, y),
                MonoTextStyle::new(&FONT_6X10, label_color),
                left,
            )
            .draw(&mut frame)
            .ok();
            Text::with_text_style(
                &self.value_text(option, editing),
                Point::new(width as i32 - 6, y),
                MonoTextStyle::new(&FONT_6X10, value_color),
                right,
            )
            .draw(&mut frame)
            .ok();
        }

        if pages > 1 {
            let footer = format!("{}/{}", page + 1, pages);
            let y = (self.display.height - FOOTER_HEIGHT) as i32;
            Text::with_text_style(
                &footer,
                Point::new(width as i32 - 6, y),
                MonoTextStyle::new(&FONT_6X10, overlay::DIM_GRAY),
                right,
            )
            .draw(&mut frame)
            .ok();
        }
        super::orient(frame, self.orientation)
    }
}

/// Message options carry either a plain command or a JSON value.
fn message_payload(payload: &str) -> Payload {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
            Payload::Value(value)
        }
        _ => Payload::Command(payload.to_string()),
    }
}

#[async_trait]
impl Mode for Menu {
    fn id(&self) -> &ModeId {
        &self.id
    }

    async fn on_input(&mut self, event: InputEvent, ctx: &mut ModeContext) {
        match event {
            InputEvent::Encoder(rotation) => {
                if self.editing.is_some() {
                    self.adjust(rotation.delta());
                } else {
                    self.move_selection(rotation.delta());
                }
            }
            InputEvent::LongPress { .. } => return,
            InputEvent::Control { .. } => match event.pressed() {
                Some(ControlId::Up) if self.editing.is_none() => self.move_selection(-1),
                Some(ControlId::Down) if self.editing.is_none() => self.move_selection(1),
                Some(ControlId::Left) => self.adjust(-1),
                Some(ControlId::Right) => self.adjust(1),
                Some(ControlId::Center) => self.select(ctx).await,
                Some(ControlId::Cross) => self.back(ctx),
                Some(ControlId::Triangle) => self.return_to_owner(ctx),
                _ => return,
            },
        }
        self.dirty = true;
    }

    async fn on_focus_enter(&mut self, _previous: Option<&ModeId>, _ctx: &mut ModeContext) {
        self.clamp_selection();
        self.dirty = true;
    }

    async fn on_focus_exit(&mut self, _ctx: &mut ModeContext) {
        self.editing = None;
    }

    async fn next_frame(&mut self) -> Option<Frame> {
        if !self.dirty {
            std::future::pending::<()>().await;
        }
        self.dirty = false;
        Some(self.render())
    }

    async fn receive_message(&mut self, sender: &Address, payload: Payload, ctx: &mut ModeContext) {
        match payload {
            Payload::Attach(owner) => self.attach(owner, ctx),
            other => debug!("menu ignoring {other:?} from {sender}"),
        }
    }

    fn set_orientation(&mut self, orientation: Orientation) {
        self.orientation = orientation;
        self.dirty = true;
    }
}
