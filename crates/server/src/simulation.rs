use tether::{Buttons, EntityState, PlayerState, UserCommand};

const MOVE_SPEED: f32 = 320.0;
const ARENA_HALF_EXTENT: f32 = 1024.0;
const ENTITY_TYPE_PLAYER: u8 = 1;
const ENTITY_TYPE_MOVER: u8 = 2;

/// Converts a packed angle back to degrees.
fn short_to_angle(value: i16) -> f32 {
    value as f32 * (360.0 / 65536.0)
}

/// Trivial authoritative world: one player state per client slot plus a
/// handful of movers orbiting the arena centre.
pub struct World {
    players: Vec<Option<PlayerState>>,
    movers: Vec<EntityState>,
    server_time: i32,
}

impl World {
    pub fn new(max_clients: usize, mover_count: u32) -> Self {
        let movers = (0..mover_count)
            .map(|i| EntityState::new(max_clients as u32 + i, ENTITY_TYPE_MOVER))
            .collect();

        Self {
            players: vec![None; max_clients],
            movers,
            server_time: 0,
        }
    }

    pub fn server_time(&self) -> i32 {
        self.server_time
    }

    pub fn spawn(&mut self, client_num: usize) {
        if let Some(slot) = self.players.get_mut(client_num) {
            *slot = Some(PlayerState {
                client_num: client_num as u32,
                health: 100,
                ..Default::default()
            });
        }
    }

    pub fn despawn(&mut self, client_num: usize) {
        if let Some(slot) = self.players.get_mut(client_num) {
            *slot = None;
        }
    }

    pub fn player(&self, client_num: usize) -> Option<&PlayerState> {
        self.players.get(client_num).and_then(Option::as_ref)
    }

    /// Runs one user command against the issuing player.
    pub fn apply_command(&mut self, client_num: usize, cmd: &UserCommand) {
        let Some(player) = self.players.get_mut(client_num).and_then(Option::as_mut) else {
            return;
        };

        let dt = (cmd.server_time - player.command_time).clamp(0, 200) as f32 / 1000.0;
        player.command_time = cmd.server_time;
        player.view_angles = cmd.angles.map(short_to_angle);
        player.weapon = cmd.weapon;

        let yaw = player.view_angles[1].to_radians();
        let (sin, cos) = yaw.sin_cos();
        let forward = cmd.forward_move as f32 / 127.0;
        let right = cmd.right_move as f32 / 127.0;

        let speed = if cmd.buttons().contains(Buttons::WALKING) {
            MOVE_SPEED * 0.5
        } else {
            MOVE_SPEED
        };
        player.velocity = [
            (forward * cos + right * sin) * speed,
            (forward * sin - right * cos) * speed,
            0.0,
        ];
        for axis in 0..2 {
            player.origin[axis] = (player.origin[axis] + player.velocity[axis] * dt)
                .clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
        }
    }

    pub fn advance(&mut self, dt_ms: i32) {
        self.server_time += dt_ms;

        let t = self.server_time as f32 / 1000.0;
        let count = self.movers.len().max(1) as f32;
        for (i, mover) in self.movers.iter_mut().enumerate() {
            let phase = t * 0.5 + i as f32 * std::f32::consts::TAU / count;
            mover.origin = [phase.cos() * 512.0, phase.sin() * 512.0, 64.0];
            mover.angles = [0.0, phase.to_degrees() % 360.0, 0.0];
            mover.frame = mover.frame.wrapping_add(1);
        }
    }

    /// Entities visible to `client_num`: every other player and every mover.
    pub fn entities_for(&self, client_num: usize) -> Vec<EntityState> {
        let players = self
            .players
            .iter()
            .enumerate()
            .filter(|(n, _)| *n != client_num)
            .filter_map(|(n, p)| p.as_ref().map(|p| (n, p)))
            .map(|(n, p)| EntityState {
                origin: p.origin,
                angles: p.view_angles,
                ..EntityState::new(n as u32, ENTITY_TYPE_PLAYER)
            });

        players.chain(self.movers.iter().copied()).collect()
    }
}
