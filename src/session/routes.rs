use std::fmt;

use uuid::Uuid;

use crate::domain::RoomId;

use super::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Home,
    Login,
    AuthCallback,
    Lobby,
    Room(RoomId),
    Game(RoomId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Allow,
    Redirect(Route),
}

impl Route {
    pub fn requires_auth(&self) -> bool {
        matches!(self, Self::Lobby | Self::Room(_) | Self::Game(_))
    }

    pub fn guest_only(&self) -> bool {
        matches!(self, Self::Login)
    }

    pub fn parse(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        match segments.as_slice() {
            [] => Some(Self::Home),
            ["login"] => Some(Self::Login),
            ["auth", "callback"] => Some(Self::AuthCallback),
            ["lobby"] => Some(Self::Lobby),
            ["room", id] => Uuid::parse_str(id).ok().map(Self::Room),
            ["game", id] => Uuid::parse_str(id).ok().map(Self::Game),
            _ => None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Home => f.write_str("/"),
            Self::Login => f.write_str("/login"),
            Self::AuthCallback => f.write_str("/auth/callback"),
            Self::Lobby => f.write_str("/lobby"),
            Self::Room(id) => write!(f, "/room/{id}"),
            Self::Game(id) => write!(f, "/game/{id}"),
        }
    }
}

pub fn guard(route: Route, identity: Option<&Identity>) -> Navigation {
    match identity {
        None if route.requires_auth() => Navigation::Redirect(Route::Login),
        Some(_) if route.guest_only() => Navigation::Redirect(Route::Lobby),
        _ => Navigation::Allow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guests_are_sent_to_login() {
        let room = Route::Room(Uuid::new_v4());
        assert_eq!(guard(room, None), Navigation::Redirect(Route::Login));
        assert_eq!(guard(Route::Home, None), Navigation::Allow);
        assert_eq!(guard(Route::Login, None), Navigation::Allow);
    }

    #[test]
    fn signed_in_players_skip_login() {
        let me = Identity::new(Uuid::new_v4(), "oink@example.com");
        assert_eq!(guard(Route::Login, Some(&me)), Navigation::Redirect(Route::Lobby));
        assert_eq!(guard(Route::Lobby, Some(&me)), Navigation::Allow);
    }

    #[test]
    fn paths_parse_back_to_routes() {
        let id = Uuid::new_v4();
        for route in [
            Route::Home,
            Route::Login,
            Route::AuthCallback,
            Route::Lobby,
            Route::Room(id),
            Route::Game(id),
        ] {
            assert_eq!(Route::parse(&route.to_string()), Some(route));
        }
        assert_eq!(Route::parse("/room/not-a-uuid"), None);
    }
}
