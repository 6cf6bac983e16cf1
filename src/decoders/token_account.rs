// DANS : src/decoders/token_account.rs

use crate::error::{WatchError, WatchResult};
use solana_program_pack::Pack;
use solana_sdk::pubkey::Pubkey;
use spl_token::state::Account as SplTokenAccount;

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTokenAccount {
    pub mint: Pubkey,
    pub owner: Pubkey,
    pub amount: u64,
}

/// Décode les données brutes d'un compte de jeton SPL.
/// `entity` ne sert qu'à rendre l'erreur lisible.
pub fn decode_token_account(entity: &Pubkey, data: &[u8]) -> WatchResult<DecodedTokenAccount> {
    let spl_account = SplTokenAccount::unpack(data).map_err(|e| WatchError::Decode {
        entity: *entity,
        reason: e.to_string(),
    })?;
    Ok(DecodedTokenAccount {
        mint: spl_account.mint,
        owner: spl_account.owner,
        amount: spl_account.amount,
    })
}

#[cfg(test)]
pub(crate) fn encode_token_account(mint: Pubkey, owner: Pubkey, amount: u64) -> Vec<u8> {
    use spl_token::state::AccountState;
    let account = SplTokenAccount {
        mint,
        owner,
        amount,
        state: AccountState::Initialized,
        ..Default::default()
    };
    let mut data = vec![0u8; SplTokenAccount::LEN];
    SplTokenAccount::pack(account, &mut data).expect("pack d'un compte valide");
    data
}
