//! Card catalogue: display metadata and deck composition.

use super::types::CardType;

/// Cards held in a full hand.
pub const HAND_SIZE: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    pub card: CardType,
    pub name: &'static str,
    pub emoji: &'static str,
    /// Copies of the card in a fresh deck.
    pub count: i32,
    pub expansion: bool,
    pub description: &'static str,
}

const CATALOGUE: [CardInfo; 10] = [
    CardInfo {
        card: CardType::Mud,
        name: "Mud",
        emoji: "💩",
        count: 21,
        expansion: false,
        description: "Makes one of your clean pigs dirty. Shout \"Dirty pig!\"",
    },
    CardInfo {
        card: CardType::Rain,
        name: "Rain",
        emoji: "🌧️",
        count: 4,
        expansion: false,
        description: "Washes every dirty pig that is not inside a barn.",
    },
    CardInfo {
        card: CardType::Lightning,
        name: "Lightning",
        emoji: "⚡",
        count: 4,
        expansion: false,
        description: "Burns down an opponent's barn unless it has a lightning rod.",
    },
    CardInfo {
        card: CardType::LightningRod,
        name: "Lightning rod",
        emoji: "🔌",
        count: 4,
        expansion: false,
        description: "Protects one of your barns from lightning.",
    },
    CardInfo {
        card: CardType::Barn,
        name: "Barn",
        emoji: "🏠",
        count: 9,
        expansion: false,
        description: "Puts one of your pigs in a barn, sheltering it from rain.",
    },
    CardInfo {
        card: CardType::BarnLock,
        name: "Barn lock",
        emoji: "🔒",
        count: 4,
        expansion: false,
        description: "Locks the barn of a dirty pig so it cannot be bathed.",
    },
    CardInfo {
        card: CardType::Bath,
        name: "Bath",
        emoji: "🛁",
        count: 8,
        expansion: false,
        description: "Washes an opponent's dirty pig.",
    },
    CardInfo {
        card: CardType::BeautifulPig,
        name: "Beautiful pig",
        emoji: "💄",
        count: 16,
        expansion: true,
        description: "Makes one of your pigs beautiful. Beautiful pigs carry an umbrella.",
    },
    CardInfo {
        card: CardType::Escape,
        name: "Escape",
        emoji: "🏃",
        count: 12,
        expansion: true,
        description: "An opponent's beautiful pig runs off and comes back plain and clean.",
    },
    CardInfo {
        card: CardType::LuckyBird,
        name: "Lucky bird",
        emoji: "🐦",
        count: 4,
        expansion: true,
        description: "Play out the rest of your hand right away.",
    },
];

pub fn card_info(card: CardType) -> &'static CardInfo {
    // CATALOGUE is declared in CardType::ALL order.
    &CATALOGUE[CardType::ALL
        .iter()
        .position(|c| *c == card)
        .unwrap_or_default()]
}

pub fn catalogue() -> &'static [CardInfo] {
    &CATALOGUE
}

/// Deck composition for a fresh game.
pub fn deck_composition(expansion: bool) -> impl Iterator<Item = (CardType, i32)> {
    CATALOGUE
        .iter()
        .filter(move |info| expansion || !info.expansion)
        .map(|info| (info.card, info.count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_order_matches_card_types() {
        for (info, card) in CATALOGUE.iter().zip(CardType::ALL) {
            assert_eq!(info.card, card);
            assert_eq!(card_info(card).card, card);
        }
    }

    #[test]
    fn base_deck_excludes_expansion_cards() {
        let base: i32 = deck_composition(false).map(|(_, n)| n).sum();
        let full: i32 = deck_composition(true).map(|(_, n)| n).sum();
        assert_eq!(base, 54);
        assert_eq!(full, 86);
        assert!(deck_composition(false).all(|(card, _)| !card_info(card).expansion));
    }
}
