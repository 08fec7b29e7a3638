use tether::{Buttons, UserCommand};

/// Converts degrees to the packed 16-bit wire angle.
fn angle_to_short(degrees: f32) -> i16 {
    ((degrees * 65536.0 / 360.0) as i32 & 0xFFFF) as u16 as i16
}

fn axis_to_move(value: f32) -> i8 {
    (value.clamp(-1.0, 1.0) * 127.0) as i8
}

#[derive(Debug, Clone, Default)]
pub struct InputState {
    pub move_direction: [f32; 3],
    pub view_yaw: f32,
    pub view_pitch: f32,
    pub walk: bool,
    pub attack: bool,
    pub alt_attack: bool,
    pub use_key: bool,
    pub weapon: u8,
}

impl InputState {
    pub fn to_command(&self, server_time: i32) -> UserCommand {
        let mut cmd = UserCommand::new(server_time);
        cmd.angles = [angle_to_short(self.view_pitch), angle_to_short(self.view_yaw), 0];
        cmd.forward_move = axis_to_move(self.move_direction[0]);
        cmd.right_move = axis_to_move(self.move_direction[1]);
        cmd.up_move = axis_to_move(self.move_direction[2]);
        cmd.weapon = self.weapon;

        let mut buttons = Buttons::empty();
        buttons.set(Buttons::WALKING, self.walk);
        buttons.set(Buttons::ATTACK, self.attack);
        buttons.set(Buttons::ALT_ATTACK, self.alt_attack);
        buttons.set(Buttons::USE, self.use_key);
        cmd.set_buttons(buttons);

        cmd
    }

    /// Scripted movement for headless runs: walk a slow circle, firing
    /// every other second.
    pub fn scripted(elapsed_ms: i32) -> Self {
        let seconds = elapsed_ms as f32 / 1000.0;
        Self {
            move_direction: [1.0, 0.0, 0.0],
            view_yaw: (seconds * 45.0) % 360.0,
            attack: (elapsed_ms / 1000) % 2 == 1,
            ..Default::default()
        }
    }
}
