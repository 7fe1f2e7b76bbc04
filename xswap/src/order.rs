use crate::asset::{Amount, Currency, InvalidCurrency};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    convert::TryFrom,
    fmt::{self, Display},
    str::FromStr,
    sync::RwLock,
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderId(Uuid);

impl OrderId {
    pub fn random() -> OrderId {
        OrderId(Uuid::new_v4())
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrderId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)?;
        Ok(OrderId(uuid))
    }
}

impl From<Uuid> for OrderId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Quantity of the base currency of a pair, in its smallest unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(u64);

impl Quantity {
    pub fn new(units: u64) -> Self {
        Quantity(units)
    }

    pub fn as_units(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Smallest units of the quote currency paid per smallest unit of the base
/// currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(u64);

impl Price {
    pub fn new(units: u64) -> Self {
        Price(units)
    }

    pub fn as_units(self) -> u64 {
        self.0
    }
}

impl Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the initiator of a swap buys or sells the base currency.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum_macros::EnumString,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Position {
    Buy,
    Sell,
}

/// A market such as `BTC_USDT`: the base currency is quoted in the second one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TradingPair {
    base: Currency,
    quote: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPair {
    #[error("trading pair '{0}' is not of the form BASE_QUOTE")]
    Format(String),
    #[error(transparent)]
    Currency(#[from] InvalidCurrency),
    #[error("trading pair uses {0} on both sides")]
    SameCurrency(Currency),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("{currency} is not part of the pair {pair}")]
    NotInPair { currency: Currency, pair: TradingPair },
    #[error("{quantity} * {price} overflows")]
    Overflow { quantity: Quantity, price: Price },
}

impl TradingPair {
    pub fn new(base: Currency, quote: Currency) -> Result<Self, InvalidPair> {
        if base == quote {
            return Err(InvalidPair::SameCurrency(base));
        }

        Ok(TradingPair { base, quote })
    }

    pub fn base(&self) -> &Currency {
        &self.base
    }

    pub fn quote(&self) -> &Currency {
        &self.quote
    }

    pub fn contains(&self, currency: &Currency) -> bool {
        &self.base == currency || &self.quote == currency
    }

    /// The other currency of the pair.
    pub fn counter_currency(&self, currency: &Currency) -> Option<&Currency> {
        if currency == &self.base {
            Some(&self.quote)
        } else if currency == &self.quote {
            Some(&self.base)
        } else {
            None
        }
    }

    /// The amount of `currency` that changes hands when `quantity` of the
    /// base currency is traded at `price`.
    pub fn amount(
        &self,
        currency: &Currency,
        quantity: Quantity,
        price: Price,
    ) -> Result<Amount, AmountError> {
        if currency == &self.base {
            return Ok(Amount::from_units(quantity.as_units()));
        }

        if currency == &self.quote {
            return Amount::from_units(quantity.as_units())
                .checked_mul(price.as_units())
                .ok_or(AmountError::Overflow { quantity, price });
        }

        Err(AmountError::NotInPair {
            currency: currency.clone(),
            pair: self.clone(),
        })
    }
}

impl Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.base, self.quote)
    }
}

impl FromStr for TradingPair {
    type Err = InvalidPair;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('_');

        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) => TradingPair::new(base.parse()?, quote.parse()?),
            _ => Err(InvalidPair::Format(s.to_owned())),
        }
    }
}

impl TryFrom<String> for TradingPair {
    type Error = InvalidPair;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TradingPair> for String {
    fn from(pair: TradingPair) -> Self {
        pair.to_string()
    }
}

/// One of our own orders as known to the order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnOrder {
    pub price: Price,
    pub available: Quantity,
}

/// Read access to our own orders, used to answer incoming swap requests.
///
/// Matching and order placement happen elsewhere; the swap engine only asks
/// what it may fill.
pub trait OwnOrders: fmt::Debug + Send + Sync + 'static {
    fn own_order(&self, pair: &TradingPair, id: &OrderId) -> Option<OwnOrder>;
}

#[derive(Debug, Default)]
pub struct OrderTable(RwLock<HashMap<(TradingPair, OrderId), OwnOrder>>);

impl OrderTable {
    pub fn insert(&self, pair: TradingPair, id: OrderId, order: OwnOrder) {
        if let Ok(mut orders) = self.0.write() {
            orders.insert((pair, id), order);
        }
    }

    pub fn remove(&self, pair: &TradingPair, id: &OrderId) -> Option<OwnOrder> {
        self.0
            .write()
            .ok()
            .and_then(|mut orders| orders.remove(&(pair.clone(), *id)))
    }
}

impl OwnOrders for OrderTable {
    fn own_order(&self, pair: &TradingPair, id: &OrderId) -> Option<OwnOrder> {
        self.0
            .read()
            .ok()
            .and_then(|orders| orders.get(&(pair.clone(), *id)).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn currency(symbol: &str) -> Currency {
        symbol.parse().unwrap()
    }

    #[test]
    fn pair_parses_base_and_quote() {
        let pair = TradingPair::from_str("A_B").unwrap();

        assert_eq!(pair.base(), &currency("A"));
        assert_eq!(pair.quote(), &currency("B"));
        assert_eq!(pair.to_string(), "A_B");
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(TradingPair::from_str("AB").is_err());
        assert!(TradingPair::from_str("A_B_C").is_err());
        assert_eq!(
            TradingPair::from_str("A_A"),
            Err(InvalidPair::SameCurrency(currency("A")))
        );
    }

    #[test]
    fn base_amount_is_the_quantity_and_quote_amount_is_quantity_times_price() {
        let pair = TradingPair::from_str("A_B").unwrap();
        let quantity = Quantity::new(10);
        let price = Price::new(5);

        assert_eq!(
            pair.amount(&currency("A"), quantity, price),
            Ok(Amount::from_units(10))
        );
        assert_eq!(
            pair.amount(&currency("B"), quantity, price),
            Ok(Amount::from_units(50))
        );
        assert!(pair.amount(&currency("C"), quantity, price).is_err());
    }

    #[test]
    fn quote_amount_overflow_is_an_error() {
        let pair = TradingPair::from_str("A_B").unwrap();

        let result = pair.amount(&currency("B"), Quantity::new(u64::MAX), Price::new(2));

        assert!(matches!(result, Err(AmountError::Overflow { .. })));
    }

    #[test]
    fn order_table_returns_inserted_orders() {
        let table = OrderTable::default();
        let pair = TradingPair::from_str("A_B").unwrap();
        let id = OrderId::random();
        let order = OwnOrder {
            price: Price::new(5),
            available: Quantity::new(10),
        };

        table.insert(pair.clone(), id, order);

        assert_eq!(table.own_order(&pair, &id), Some(order));
        assert_eq!(table.own_order(&pair, &OrderId::random()), None);
    }
}
